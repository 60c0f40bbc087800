use crate::consts::THREAD_STACK_SIZE;
use crate::cpu::{self, CpuState};
use crate::errno::Sysreturn;
use crate::lock::irq_guarded;
use crate::memory::stack::Stack;
use crate::sched::context::{Context, ContextKind, ContextVariant, context_schedule_return, context_switch};
use crate::sched::kcontext::SyscallContext;
use crate::sched::runloop::kern_yield;
use crate::sched::switch::switch_and_call;
use crate::stats;
use crate::time::timer::{TIMER_DISABLED, kernel_timers};
use crate::time::ClockId;
use alloc::boxed::Box;
use alloc::vec::Vec;
use atomic_enum::atomic_enum;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use spin::Mutex;

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum ThreadState {
    Ready = 0,
    Running,
    Blocked,
    Zombie,
}

/// An application thread: a context with its own stack, scheduled through
/// the per-CPU run queues. Thread records are recycled through a free
/// list on exit, never returned to the heap.
pub struct ThreadContext {
    ctx: Context,
    stack: Stack,
    id: AtomicU64,
    name: Mutex<&'static str>,
    pub state: AtomicThreadState,
    io_result: AtomicI64,
    entry: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Syscall context staged for the trampoline while entering a
    /// blocking operation.
    syscall: Mutex<Option<&'static SyscallContext>>,
}

impl ThreadContext {
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        *self.name.lock()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn set_io_result(&self, rv: Sysreturn) {
        self.io_result.store(rv, Ordering::Release);
    }

    pub fn take_io_result(&self) -> Sysreturn {
        self.io_result.load(Ordering::Acquire)
    }
}

impl ContextVariant for ThreadContext {
    fn context(&self) -> &Context {
        &self.ctx
    }

    fn as_thread(&'static self) -> Option<&'static ThreadContext> {
        Some(self)
    }

    fn on_schedule_return(&'static self) {
        make_runnable(self);
    }

    fn on_recycle(&'static self) {
        irq_guarded(|| FREE_THREADS.lock().push(self));
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static FREE_THREADS: Mutex<Vec<&'static ThreadContext>> = Mutex::new(Vec::new());

fn allocate_thread() -> &'static ThreadContext {
    let stack = Stack::new(THREAD_STACK_SIZE);
    let ctx = Context::new(ContextKind::Thread, stack.top());
    Box::leak(Box::new(ThreadContext {
        ctx,
        stack,
        id: AtomicU64::new(0),
        name: Mutex::new(""),
        state: AtomicThreadState::new(ThreadState::Ready),
        io_result: AtomicI64::new(0),
        entry: Mutex::new(None),
        syscall: Mutex::new(None),
    }))
}

/// Build the callee-saved switch image a first dispatch will restore.
/// Layout must mirror `restore_switch_frame!`: rflags lowest, then
/// r15..rbx, a spare rip slot, then the entry rip.
fn init_switch_image(t: &ThreadContext) {
    let frame = unsafe { t.ctx.frame() };
    let top = frame.stack_top();
    unsafe {
        let p = top as *mut u64;
        p.sub(1).write(thread_trampoline as usize as u64);
        for i in 2..=8 {
            p.sub(i).write(0);
        }
        p.sub(9).write(0x202); // IF set
    }
    frame.set_saved_rsp(top - 9 * 8);
    frame.set_full(false);
}

pub fn spawn(name: &'static str, f: impl FnOnce() + Send + 'static) -> &'static ThreadContext {
    let t = match irq_guarded(|| FREE_THREADS.lock().pop()) {
        Some(t) => {
            t.ctx.reset_refs();
            unsafe { t.ctx.frame() }.reset_stack();
            t
        }
        None => allocate_thread(),
    };
    t.id.store(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
    *t.name.lock() = name;
    *t.entry.lock() = Some(Box::new(f));
    t.io_result.store(0, Ordering::Relaxed);
    init_switch_image(t);
    log::debug!("thread {} ({}) spawned", t.id(), name);
    make_runnable(t);
    t
}

extern "C" fn thread_trampoline() -> ! {
    let ci = cpu::current_cpu();
    let t = ci
        .current_context()
        .as_thread()
        .expect("thread trampoline without a thread context");
    ci.state.store(CpuState::User, Ordering::Relaxed);
    let f = t.entry.lock().take().expect("thread has no entry");
    f();
    exit();
}

/// Terminate the current thread. The record recycles once the runloop is
/// off this stack.
pub fn exit() -> ! {
    let ci = cpu::current_cpu();
    let t = current_thread();
    ci.state.store(CpuState::Kernel, Ordering::Relaxed);
    t.state.store(ThreadState::Zombie, Ordering::Release);
    log::debug!("thread {} ({}) exited", t.id(), t.name());
    ci.set_retiring(t);
    kern_yield();
}

pub fn current_thread() -> &'static ThreadContext {
    cpu::current_cpu()
        .current_context()
        .as_thread()
        .expect("not running in a thread context")
}

/// Queue a thread, preferring an idle CPU (woken by IPI) over the local
/// one.
pub fn make_runnable(t: &'static ThreadContext) {
    t.state.store(ThreadState::Ready, Ordering::Release);
    irq_guarded(|| {
        let local = cpu::current_cpu();
        let target = stats::pick_idle_cpu()
            .filter(|id| *id != local.id)
            .and_then(cpu::try_get_ready_cpu)
            .filter(|ci| !ci.thread_queue.is_full())
            .unwrap_or(local);
        target
            .thread_queue
            .enqueue(t)
            .unwrap_or_else(|_| panic!("run queue overflow on cpu {}", target.id));
        if target.id != local.id {
            crate::apic::send_reschedule_ipi(target.local_apic_id);
        }
    });
}

/// One-shot completion handle: delivery stores the result and wakes the
/// issuing thread through its schedule-return hook. Exactly-once is
/// enforced by move semantics.
pub struct IoCompletion {
    thread: &'static ThreadContext,
}

impl IoCompletion {
    pub fn complete(self, rv: Sysreturn) {
        self.thread.set_io_result(rv);
        context_schedule_return(self.thread);
    }
}

/// Run a potentially blocking kernel operation.
///
/// The calling thread parks its callee-saved state and the operation runs
/// on a syscall context borrowed from the per-CPU pool. The operation
/// must deliver its result through the completion exactly once: inline,
/// or later from bottom-half context after a blockq wake. The thread
/// resumes here once the completion has been delivered and a runloop
/// dispatched it again, possibly on a different CPU.
pub fn syscall_enter(op: impl FnOnce(IoCompletion) + Send + 'static) -> Sysreturn {
    let ci = cpu::current_cpu();
    let t = current_thread();
    assert!(!ci.in_bottom_half(), "blocking operation from bottom-half context");
    ci.state.store(CpuState::Kernel, Ordering::Relaxed);
    t.state.store(ThreadState::Blocked, Ordering::Release);

    let sc = SyscallContext::get(ci);
    let completion = IoCompletion { thread: t };
    *sc.op.lock() = Some(Box::new(move || op(completion)));
    *t.syscall.lock() = Some(sc);

    unsafe { switch_and_call(t.ctx.saved_rsp_slot(), sc.stack_top(), syscall_trampoline) };

    // woken with the result delivered
    cpu::current_cpu().state.store(CpuState::User, Ordering::Relaxed);
    t.take_io_result()
}

extern "C" fn syscall_trampoline() -> ! {
    let ci = cpu::current_cpu();
    let t = ci
        .current_context()
        .as_thread()
        .expect("syscall trampoline without a thread context");
    let sc = t.syscall.lock().take().expect("no staged syscall context");
    context_switch(sc);
    let op = sc.op.lock().take().expect("no staged operation");
    op();
    // Completed inline or parked on a blockq: either way this stack is
    // finished. Recycle once the runloop is off it.
    ci.set_retiring(sc);
    kern_yield();
}

/// Voluntarily give up the CPU, staying runnable.
pub fn yield_now() {
    let ci = cpu::current_cpu();
    let t = current_thread();
    ci.state.store(CpuState::Kernel, Ordering::Relaxed);
    t.state.store(ThreadState::Ready, Ordering::Release);
    ci.thread_queue
        .enqueue_irqsafe(t)
        .unwrap_or_else(|_| panic!("run queue overflow on cpu {}", ci.id));
    unsafe {
        switch_and_call(
            t.ctx.saved_rsp_slot(),
            ci.kernel_context().stack_top(),
            yield_trampoline,
        )
    };
    cpu::current_cpu().state.store(CpuState::User, Ordering::Relaxed);
}

extern "C" fn yield_trampoline() -> ! {
    kern_yield()
}

/// Block the current thread for `ns` nanoseconds via a one-shot timer
/// completion.
pub fn sleep(ns: u64) {
    let rv = syscall_enter(move |completion| {
        let mut completion = Some(completion);
        kernel_timers().register(
            ClockId::Monotonic,
            ns,
            false,
            None,
            Box::new(move |_expiry, overruns| {
                if overruns == TIMER_DISABLED {
                    return;
                }
                if let Some(c) = completion.take() {
                    c.complete(0);
                }
            }),
        );
    });
    debug_assert!(rv == 0);
}
