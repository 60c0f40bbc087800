use crate::cpu::{self, CpuInfo, CpuState};
use crate::queue::Queue;
use crate::sched::context::{context_pause, context_resume, context_switch};
use crate::sched::switch::{frame_return, jump_to_saved, switch_stack};
use crate::sched::thread::{ThreadContext, ThreadState};
use crate::stats;
use crate::time::timer::{Timerqueue, kernel_timers};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Lazy;
use x86_64::instructions::interrupts;

/// Deferred kernel work, dequeued by the runloop outside interrupt
/// context. The timer service variant carries no storage so scheduling it
/// from the interrupt path never allocates.
pub enum BottomHalf {
    TimerService(&'static Timerqueue),
    Thunk(Box<dyn FnOnce() + Send>),
}

/// One deferred status/completion invocation.
pub struct Async1 {
    pub f: Box<dyn FnOnce(u64) + Send>,
    pub arg: u64,
}

const BHQUEUE_DEPTH: usize = 512;
const ASYNC_QUEUE_1_DEPTH: usize = 512;

static BHQUEUE: Lazy<Queue<BottomHalf>> = Lazy::new(|| Queue::new(BHQUEUE_DEPTH));
static ASYNC_QUEUE_1: Lazy<Queue<Async1>> = Lazy::new(|| Queue::new(ASYNC_QUEUE_1_DEPTH));

pub fn enqueue_bottom_half(bh: BottomHalf) -> Result<(), BottomHalf> {
    BHQUEUE.enqueue_irqsafe(bh)
}

/// Defer a completion out of the submitter's context. Strict FIFO,
/// bounded; a full queue hands the pair back and the caller must retry or
/// synthesize a local error.
pub fn async_apply_1(f: Box<dyn FnOnce(u64) + Send>, arg: u64) -> Result<(), Async1> {
    ASYNC_QUEUE_1.enqueue_irqsafe(Async1 { f, arg })
}

/// Schedule the kernel timerqueue's service pass. The CAS inside
/// `try_schedule_service` keeps duplicate services from piling up.
pub fn schedule_timer_service() {
    let tq = kernel_timers();
    if tq.try_schedule_service()
        && enqueue_bottom_half(BottomHalf::TimerService(tq)).is_err()
    {
        panic!("bottom-half queue full scheduling timer service");
    }
}

static KERNEL_LOCK: AtomicBool = AtomicBool::new(false);

pub fn kernel_lock(ci: &CpuInfo) {
    while KERNEL_LOCK
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }
    ci.have_kernel_lock.store(true, Ordering::Relaxed);
}

pub fn kernel_unlock(ci: &CpuInfo) {
    ci.have_kernel_lock.store(false, Ordering::Relaxed);
    KERNEL_LOCK.store(false, Ordering::Release);
}

/// Transfer control to this CPU's designated kernel context and run the
/// scheduler loop on its stack. Never returns.
///
/// Interrupts stay off from the pause of the previous context until the
/// loop is on the kernel stack: the interrupt stub saves into whatever
/// frame is current, and a released context's frame may already be in
/// use on another CPU.
pub fn runloop() -> ! {
    interrupts::disable();
    let ci = cpu::current_cpu();
    let kc = ci.kernel_context();
    context_switch(kc); // nop if already installed
    unsafe { switch_stack(kc.stack_top(), runloop_internal) }
}

#[inline]
pub fn kern_yield() -> ! {
    runloop()
}

/// Entry used by the timer stub after deciding to preempt: we arrive on
/// the kernel context stack, the interrupted thread's full frame is
/// saved, and the thread is already back on a run queue.
pub extern "C" fn runloop_preempt_entry() -> ! {
    let ci = cpu::current_cpu();
    let prev = ci.current_context();
    context_pause(prev);
    context_resume(ci.kernel_context());
    runloop_internal()
}

/// Per-pass ordering contract: retired contexts are dropped, then every
/// bottom half in insertion order, then every async-1 completion, then
/// one thread. A bottom half enqueued before a thread was made runnable
/// is therefore always observed first.
pub extern "C" fn runloop_internal() -> ! {
    let ci = cpu::current_cpu();
    loop {
        if let Some(retired) = ci.take_retiring() {
            retired.release();
        }
        ci.state.store(CpuState::Kernel, Ordering::Relaxed);
        interrupts::enable();

        kernel_lock(ci);
        process_bhqueue(ci);
        process_async_queue_1(ci);
        kernel_unlock(ci);

        if let Some(t) = ci.thread_queue.dequeue_irqsafe() {
            dispatch_thread(ci, t);
        }

        // Nothing runnable. Close the race against a concurrent enqueue
        // by re-checking with interrupts off; sti;hlt takes any interrupt
        // pended in between immediately after the halt.
        interrupts::disable();
        if BHQUEUE.is_empty() && ASYNC_QUEUE_1.is_empty() && ci.thread_queue.is_empty() {
            ci.state.store(CpuState::Idle, Ordering::Relaxed);
            stats::set_cpu_idle(ci.id);
            interrupts::enable_and_hlt();
            stats::clear_cpu_idle(ci.id);
        } else {
            interrupts::enable();
        }
    }
}

fn process_bhqueue(ci: &CpuInfo) {
    ci.in_bh.store(true, Ordering::Relaxed);
    while let Some(bh) = BHQUEUE.dequeue_irqsafe() {
        match bh {
            BottomHalf::TimerService(tq) => tq.service(),
            BottomHalf::Thunk(f) => f(),
        }
    }
    // async-1 completions also run in bottom-half context; the flag stays
    // set until both queues are drained
}

fn process_async_queue_1(ci: &CpuInfo) {
    while let Some(a) = ASYNC_QUEUE_1.dequeue_irqsafe() {
        (a.f)(a.arg);
    }
    ci.in_bh.store(false, Ordering::Relaxed);
}

/// Switch onto a runnable thread. Preempted threads resume through their
/// full interrupt-time frame, voluntary yielders through the callee-saved
/// switch image.
fn dispatch_thread(ci: &'static CpuInfo, t: &'static ThreadContext) -> ! {
    interrupts::disable();
    t.state.store(ThreadState::Running, Ordering::Relaxed);
    context_switch(t);
    ci.frcount.fetch_add(1, Ordering::Relaxed);
    ci.state.store(CpuState::User, Ordering::Relaxed);
    let frame = unsafe { t.context().frame() };
    if frame.is_full() {
        unsafe { frame_return(t.context().frame_ptr()) }
    } else {
        unsafe { jump_to_saved(frame.saved_rsp()) }
    }
}
