use crate::cpu::{self, CpuInfo};
use crate::sched::frame::{FRAME_SAVED_RSP, Frame};
use crate::sched::thread::ThreadContext;
use crate::shutting_down;
use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// `active_cpu` sentinel: no CPU holds the context.
pub const CONTEXT_UNOWNED: u32 = u32::MAX;

/// Hard bound on the acquire spin. Exhaustion is a lost-release bug, not
/// a fairness problem, so it traps.
pub const CONTEXT_RESUME_SPIN_LIMIT: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Kernel,
    Syscall,
    Thread,
}

/// Invoked on a trap while the context is current. Returns true when the
/// fault was handled and the frame may be resumed.
pub type FaultHandler = Box<dyn FnMut(&mut Frame) -> bool + Send>;

/// Execution state installable on a CPU: a frame, a stack, ownership, and
/// a refcount whose final release recycles the containing variant.
pub struct Context {
    kind: ContextKind,
    frame: UnsafeCell<Frame>,
    active_cpu: AtomicU32,
    refs: AtomicU32,
    fault_handler: Mutex<Option<FaultHandler>>,
}

// The frame cell is only touched by the owning CPU (and its interrupt
// stub); the ownership protocol below serializes that.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub fn new(kind: ContextKind, stack_top: u64) -> Context {
        let mut frame = Frame::new();
        frame.set_stack_top(stack_top);
        frame.reset_stack();
        Context {
            kind,
            frame: UnsafeCell::new(frame),
            active_cpu: AtomicU32::new(CONTEXT_UNOWNED),
            refs: AtomicU32::new(1),
            fault_handler: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == ContextKind::Kernel
    }

    pub fn is_syscall(&self) -> bool {
        self.kind == ContextKind::Syscall
    }

    pub fn is_thread(&self) -> bool {
        self.kind == ContextKind::Thread
    }

    pub fn active_cpu(&self) -> u32 {
        self.active_cpu.load(Ordering::Relaxed)
    }

    pub fn frame_ptr(&self) -> *mut u64 {
        self.frame.get() as *mut u64
    }

    /// Pointer to the FRAME_SAVED_RSP word, handed to `switch_and_call`.
    pub fn saved_rsp_slot(&self) -> *mut u64 {
        unsafe { self.frame_ptr().add(FRAME_SAVED_RSP) }
    }

    /// # Safety
    /// Caller must be the owning CPU (or be initializing the context
    /// before it is shared).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame(&self) -> &mut Frame {
        unsafe { &mut *self.frame.get() }
    }

    pub fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// True when this was the final reference and the variant must be
    /// recycled.
    pub fn release_ref(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "context refcount underflow");
        prev == 1
    }

    pub fn reset_refs(&self) {
        self.refs.store(1, Ordering::Relaxed);
    }

    pub fn install_fault_handler(&self, h: FaultHandler) {
        let mut slot = self.fault_handler.lock();
        assert!(slot.is_none(), "fault handler already installed");
        *slot = Some(h);
    }

    pub fn clear_fault_handler(&self) {
        *self.fault_handler.lock() = None;
    }

    pub fn take_fault_handler(&self) -> Option<FaultHandler> {
        self.fault_handler.lock().take()
    }
}

/// The capability surface of a context variant: the pause/resume/
/// schedule-return hooks plus the recycler that runs on final release.
pub trait ContextVariant: Send + Sync {
    fn context(&self) -> &Context;

    fn on_pause(&'static self) {}
    fn on_resume(&'static self) {}
    /// Make the context runnable again after a completion.
    fn on_schedule_return(&'static self) {}
    /// Final-release recycler; the variant returns itself to its pool.
    fn on_recycle(&'static self) {}

    fn as_thread(&'static self) -> Option<&'static ThreadContext> {
        None
    }

    /// Drop one reference; recycle on the last one. Must not run while
    /// any CPU is still executing on the context's stack: park through
    /// the cpuinfo retiring slot for that.
    fn release(&'static self) {
        if self.context().release_ref() {
            self.on_recycle();
        }
    }
}

pub type Ctx = &'static dyn ContextVariant;

fn same_context(a: Ctx, b: Ctx) -> bool {
    core::ptr::eq(a.context(), b.context())
}

/// Take exclusive ownership of `c` for `cpu`, spinning while another CPU
/// holds it. The bound is a liveness check: exceeding it is a bug.
pub fn context_acquire(c: &Context, cpu: u32) {
    assert!(c.active_cpu.load(Ordering::Relaxed) != cpu, "context already owned by this CPU");
    let mut remain = CONTEXT_RESUME_SPIN_LIMIT;
    while c
        .active_cpu
        .compare_exchange_weak(CONTEXT_UNOWNED, cpu, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
        remain -= 1;
        assert!(remain > 0, "context acquire spun out");
    }
}

/// Precondition: no frame writes from other CPUs in flight (they cannot
/// be, by the ownership protocol).
pub fn context_release(c: &Context) {
    let owner = c.active_cpu.load(Ordering::Relaxed);
    assert!(owner != CONTEXT_UNOWNED, "context already released");
    assert!(owner == cpu::current_cpu().id, "context released by non-owner");
    c.active_cpu.store(CONTEXT_UNOWNED, Ordering::Release);
}

pub fn context_pause(c: Ctx) {
    if !shutting_down() {
        c.on_pause();
    }
    context_release(c.context());
}

/// May not return if the resume hook transfers control.
pub fn context_resume(c: Ctx) {
    let ci = cpu::current_cpu();
    if !shutting_down() {
        context_acquire(c.context(), ci.id);
    }
    ci.set_current_context(c);
    if !shutting_down() {
        c.on_resume();
    }
}

pub fn context_schedule_return(c: Ctx) {
    c.on_schedule_return();
}

/// No-op when `c` is already current; otherwise balanced pause of the
/// previous context and resume of `c`.
pub fn context_switch(c: Ctx) {
    let ci = cpu::current_cpu();
    let prev = ci.current_context();
    if !same_context(prev, c) {
        context_pause(prev);
        context_resume(c);
    }
}

/// Install a fault handler on the current (kernel) context for the
/// duration of a fixup region.
pub fn use_fault_handler(h: FaultHandler) {
    let ctx = cpu::current_cpu().current_context();
    assert!(ctx.context().is_kernel());
    ctx.context().install_fault_handler(h);
}

pub fn clear_fault_handler() {
    cpu::current_cpu().current_context().context().clear_fault_handler();
}

pub fn in_interrupt(ci: &CpuInfo) -> bool {
    ci.state.load(Ordering::Relaxed) == crate::cpu::CpuState::Interrupt
}
