pub mod fd;
pub mod pipe;

use crate::cpu::{self, CpuState};
use crate::errno::{Errno, result_from};
use crate::notify::Epoll;
use crate::sched::thread::syscall_enter;
use crate::unix::fd::{OpenFlags, UserBuf};
use core::sync::atomic::Ordering;

/// Non-blocking entry points still take kernel locks, and lock holders
/// must not be preemptible: hold this guard across them.
struct KernelEntry {
    prev: CpuState,
}

fn kernel_entry() -> KernelEntry {
    let ci = cpu::current_cpu();
    let prev = ci.state.load(Ordering::Relaxed);
    ci.state.store(CpuState::Kernel, Ordering::Relaxed);
    KernelEntry { prev }
}

impl Drop for KernelEntry {
    fn drop(&mut self) {
        cpu::current_cpu().state.store(self.prev, Ordering::Relaxed);
    }
}

pub fn pipe2(flags: OpenFlags) -> Result<(i32, i32), Errno> {
    let _k = kernel_entry();
    pipe::do_pipe2(flags)
}

/// Blocking read. Runs on a syscall context; suspension goes through the
/// endpoint's blockq.
pub fn read(fd: i32, buf: &mut [u8]) -> Result<usize, Errno> {
    let ops = fd::get_fd(fd).ok_or(Errno::Badf)?;
    let dest = UserBuf::from_mut(buf);
    let rv = syscall_enter(move |completion| {
        ops.read(dest, completion);
    });
    result_from(rv)
}

pub fn write(fd: i32, buf: &[u8]) -> Result<usize, Errno> {
    let ops = fd::get_fd(fd).ok_or(Errno::Badf)?;
    let src = UserBuf::from_ref(buf);
    let rv = syscall_enter(move |completion| {
        ops.write(src, completion);
    });
    result_from(rv)
}

pub fn close(fd_num: i32) -> Result<(), Errno> {
    let ops = fd::remove_fd(fd_num).ok_or(Errno::Badf)?;
    let _k = kernel_entry();
    result_from(ops.close()).map(|_| ())
}

pub fn events(fd_num: i32) -> Result<Epoll, Errno> {
    let ops = fd::get_fd(fd_num).ok_or(Errno::Badf)?;
    let _k = kernel_entry();
    Ok(ops.events())
}

pub fn pipe_set_capacity(fd_num: i32, capacity: usize) -> Result<usize, Errno> {
    let ops = fd::get_fd(fd_num).ok_or(Errno::Badf)?;
    let _k = kernel_entry();
    result_from(ops.set_capacity(capacity))
}

pub fn pipe_get_capacity(fd_num: i32) -> Result<usize, Errno> {
    let ops = fd::get_fd(fd_num).ok_or(Errno::Badf)?;
    let _k = kernel_entry();
    result_from(ops.get_capacity())
}

/// Subscribe an edge-triggered event handler to an fd.
pub fn register_notify(
    fd_num: i32,
    mask: Epoll,
    handler: crate::notify::EventHandler,
) -> Result<(), Errno> {
    let ops = fd::get_fd(fd_num).ok_or(Errno::Badf)?;
    let _k = kernel_entry();
    result_from(ops.register_notify(mask, handler)).map(|_| ())
}
