use crate::errno::{Errno, Sysreturn};
use crate::lock::irq_guarded;
use crate::notify::{Epoll, EventHandler};
use crate::sched::thread::IoCompletion;
use alloc::collections::BTreeMap;
use bitflags::bitflags;
use core::sync::atomic::{AtomicI32, Ordering};
use spin::Mutex;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const O_NONBLOCK = 0x800;
        const O_DIRECT = 0x4000;
        const O_CLOEXEC = 0x80000;
    }
}

/// A caller buffer captured into a blockq action. The raw pointer stays
/// valid for the lifetime of the operation because the issuing thread is
/// parked until its completion is delivered.
#[derive(Clone, Copy)]
pub struct UserBuf {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for UserBuf {}

impl UserBuf {
    pub fn from_mut(buf: &mut [u8]) -> UserBuf {
        UserBuf {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    pub fn from_ref(buf: &[u8]) -> UserBuf {
        UserBuf {
            ptr: buf.as_ptr() as *mut u8,
            len: buf.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` to the head of the buffer.
    ///
    /// # Safety
    /// The issuing thread must still be parked on this operation and
    /// `src.len() <= self.len()`.
    pub unsafe fn copy_from(&self, src: &[u8]) {
        debug_assert!(src.len() <= self.len);
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr, src.len()) };
    }

    /// View the buffer as a byte slice.
    ///
    /// # Safety
    /// The issuing thread must still be parked on this operation.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Per-fd hooks: an I/O operation for each direction, an events query,
/// and a close. I/O results are delivered through the completion exactly
/// once; the raw return is what the underlying blockq check produced.
pub trait FdOps: Send + Sync {
    fn read(&'static self, _dest: UserBuf, completion: IoCompletion) -> Sysreturn {
        let rv = Errno::Inval.as_sysreturn();
        completion.complete(rv);
        rv
    }

    fn write(&'static self, _src: UserBuf, completion: IoCompletion) -> Sysreturn {
        let rv = Errno::Inval.as_sysreturn();
        completion.complete(rv);
        rv
    }

    fn events(&'static self) -> Epoll {
        Epoll::empty()
    }

    fn close(&'static self) -> Sysreturn {
        0
    }

    fn set_capacity(&'static self, _capacity: usize) -> Sysreturn {
        Errno::Inval.as_sysreturn()
    }

    fn get_capacity(&'static self) -> Sysreturn {
        Errno::Inval.as_sysreturn()
    }

    /// Subscribe to edge-triggered readiness events on this fd.
    fn register_notify(&'static self, _mask: Epoll, _handler: EventHandler) -> Sysreturn {
        Errno::Inval.as_sysreturn()
    }
}

const MAX_FDS: usize = 1024;

static FD_TABLE: Mutex<BTreeMap<i32, &'static dyn FdOps>> = Mutex::new(BTreeMap::new());
static NEXT_FD: AtomicI32 = AtomicI32::new(3); // 0..2 reserved

pub fn allocate_fd(ops: &'static dyn FdOps) -> Result<i32, Errno> {
    irq_guarded(|| {
        let mut table = FD_TABLE.lock();
        if table.len() >= MAX_FDS {
            return Err(Errno::Mfile);
        }
        let fd = NEXT_FD.fetch_add(1, Ordering::Relaxed);
        table.insert(fd, ops);
        Ok(fd)
    })
}

pub fn get_fd(fd: i32) -> Option<&'static dyn FdOps> {
    irq_guarded(|| FD_TABLE.lock().get(&fd).copied())
}

pub fn remove_fd(fd: i32) -> Option<&'static dyn FdOps> {
    irq_guarded(|| FD_TABLE.lock().remove(&fd))
}

pub fn open_fds() -> usize {
    irq_guarded(|| FD_TABLE.lock().len())
}
