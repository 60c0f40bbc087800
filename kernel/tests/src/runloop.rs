use crate::{TestResult, wait_until};
use alloc::boxed::Box;
use alloc::format;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use uno_kernel::apic;
use uno_kernel::cpu;
use uno_kernel::interrupt::handlers::TIMER_INTERRUPT_COUNT;
use uno_kernel::sched::runloop::{BottomHalf, async_apply_1, enqueue_bottom_half};
use uno_kernel::sched::thread;
use uno_kernel::time::{milliseconds, seconds};
use x86_64::instructions::interrupts;

pub fn timer_interrupt_fires() -> TestResult {
    let before = TIMER_INTERRUPT_COUNT.load(Ordering::Relaxed);
    thread::sleep(milliseconds(10));
    let after = TIMER_INTERRUPT_COUNT.load(Ordering::Relaxed);
    if after > before {
        TestResult::Ok
    } else {
        TestResult::Failed("no timer interrupts observed across a sleep".into())
    }
}

/// A bottom half queued before this thread yields must have executed by
/// the time the thread is dispatched again.
pub fn bottom_half_runs_before_thread() -> TestResult {
    static BH_DONE: AtomicBool = AtomicBool::new(false);
    BH_DONE.store(false, Ordering::SeqCst);
    enqueue_bottom_half(BottomHalf::Thunk(Box::new(|| {
        BH_DONE.store(true, Ordering::SeqCst);
    })))
    .unwrap_or_else(|_| panic!("bottom-half queue full"));
    thread::yield_now();
    if BH_DONE.load(Ordering::SeqCst) {
        TestResult::Ok
    } else {
        TestResult::Failed("thread dispatched before queued bottom half ran".into())
    }
}

/// A thunk queued on another CPU's message queue runs there, in its
/// interrupt context.
pub fn cross_cpu_thunks_run() -> TestResult {
    if cpu::cpus_count() == 1 {
        return TestResult::Ok;
    }
    static RAN_ON: AtomicU32 = AtomicU32::new(u32::MAX);
    RAN_ON.store(u32::MAX, Ordering::SeqCst);

    let sent_to = interrupts::without_interrupts(|| {
        let local = cpu::current_cpu();
        let target = (0..cpu::cpus_count() as u32)
            .filter(|id| *id != local.id)
            .find_map(cpu::try_get_ready_cpu)?;
        apic::send_cpu_thunk(
            target,
            Box::new(|| {
                RAN_ON.store(cpu::current_cpu().id, Ordering::SeqCst);
            }),
        )
        .ok()?;
        Some(target.id)
    });
    let Some(sent_to) = sent_to else {
        return TestResult::Failed("no other ready CPU to message".into());
    };
    if !wait_until(seconds(2), || RAN_ON.load(Ordering::SeqCst) != u32::MAX) {
        return TestResult::Failed("cross-CPU thunk never ran".into());
    }
    let ran_on = RAN_ON.load(Ordering::SeqCst);
    if ran_on != sent_to {
        return TestResult::Failed(format!("thunk ran on cpu {ran_on}, sent to {sent_to}"));
    }
    TestResult::Ok
}

/// Async-1 completions run after bottom halves within a pass, even when
/// queued first, and receive their argument word.
pub fn async1_runs_after_bottom_halves() -> TestResult {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    static BH_SEQ: AtomicU64 = AtomicU64::new(0);
    static A1_SEQ: AtomicU64 = AtomicU64::new(0);
    static A1_ARG: AtomicU64 = AtomicU64::new(0);
    SEQ.store(1, Ordering::SeqCst);
    BH_SEQ.store(0, Ordering::SeqCst);
    A1_SEQ.store(0, Ordering::SeqCst);

    interrupts::without_interrupts(|| {
        async_apply_1(
            Box::new(|arg| {
                A1_ARG.store(arg, Ordering::SeqCst);
                A1_SEQ.store(SEQ.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            }),
            7,
        )
        .unwrap_or_else(|_| panic!("async-1 queue full"));
        enqueue_bottom_half(BottomHalf::Thunk(Box::new(|| {
            BH_SEQ.store(SEQ.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        })))
        .unwrap_or_else(|_| panic!("bottom-half queue full"));
    });
    thread::yield_now();

    if !wait_until(seconds(1), || {
        BH_SEQ.load(Ordering::SeqCst) != 0 && A1_SEQ.load(Ordering::SeqCst) != 0
    }) {
        return TestResult::Failed("queued work never ran".into());
    }
    let (bh, a1) = (BH_SEQ.load(Ordering::SeqCst), A1_SEQ.load(Ordering::SeqCst));
    if bh >= a1 {
        return TestResult::Failed(format!("async-1 (seq {a1}) ran before bottom half (seq {bh})"));
    }
    if A1_ARG.load(Ordering::SeqCst) != 7 {
        return TestResult::Failed("async-1 argument word was not delivered".into());
    }
    TestResult::Ok
}
