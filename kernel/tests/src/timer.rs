use crate::{TestResult, wait_until};
use alloc::boxed::Box;
use alloc::format;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use uno_kernel::sched::thread;
use uno_kernel::time::timer::{TIMER_DISABLED, kernel_timers};
use uno_kernel::time::{self, ClockId, milliseconds, seconds};

pub fn one_shot_fires() -> TestResult {
    static FIRED: AtomicBool = AtomicBool::new(false);
    kernel_timers().register(
        ClockId::Monotonic,
        milliseconds(5),
        false,
        None,
        Box::new(|_expiry, overruns| {
            if overruns != TIMER_DISABLED {
                FIRED.store(true, Ordering::SeqCst);
            }
        }),
    );
    if wait_until(seconds(2), || FIRED.load(Ordering::SeqCst)) {
        TestResult::Ok
    } else {
        TestResult::Failed("one-shot timer never fired".into())
    }
}

/// Each periodic expiry is computed from the previous expiry, so the
/// scheduled deadlines are exact multiples of the period apart no matter
/// how late the service pass ran.
pub fn periodic_expiry_has_no_drift() -> TestResult {
    static EXPIRIES: Mutex<heapless::Vec<u64, 4>> = Mutex::new(heapless::Vec::new());
    let period = milliseconds(2);
    let timer = kernel_timers().register(
        ClockId::Monotonic,
        period,
        false,
        Some(period),
        Box::new(|expiry, overruns| {
            if overruns != TIMER_DISABLED {
                let _ = EXPIRIES.lock().push(expiry);
            }
        }),
    );
    let filled = wait_until(seconds(2), || EXPIRIES.lock().len() >= 3);
    timer.cancel();
    if !filled {
        return TestResult::Failed("periodic timer fired fewer than 3 times".into());
    }
    let e = EXPIRIES.lock();
    for w in e.windows(2) {
        let delta = w[1] - w[0];
        if delta == 0 || delta % period != 0 {
            return TestResult::Failed(format!(
                "expiry delta {delta} is not a whole number of periods ({period})"
            ));
        }
    }
    TestResult::Ok
}

pub fn equal_expiries_fire_in_registration_order() -> TestResult {
    static ORDER: Mutex<heapless::Vec<u8, 4>> = Mutex::new(heapless::Vec::new());
    let at = time::kern_now(ClockId::Monotonic) + milliseconds(10);
    for mark in [1u8, 2u8] {
        kernel_timers().register(
            ClockId::Monotonic,
            at,
            true,
            None,
            Box::new(move |_expiry, overruns| {
                if overruns != TIMER_DISABLED {
                    let _ = ORDER.lock().push(mark);
                }
            }),
        );
    }
    if !wait_until(seconds(2), || ORDER.lock().len() == 2) {
        return TestResult::Failed("tied timers did not both fire".into());
    }
    let order = ORDER.lock();
    if order[0] == 1 && order[1] == 2 {
        TestResult::Ok
    } else {
        TestResult::Failed(format!("tied timers fired out of order: {:?}", &order[..]))
    }
}

pub fn cancelled_timer_does_not_fire() -> TestResult {
    static FIRED: AtomicBool = AtomicBool::new(false);
    let timer = kernel_timers().register(
        ClockId::Monotonic,
        milliseconds(10),
        false,
        None,
        Box::new(|_expiry, overruns| {
            if overruns != TIMER_DISABLED {
                FIRED.store(true, Ordering::SeqCst);
            }
        }),
    );
    timer.cancel();
    thread::sleep(milliseconds(50));
    if FIRED.load(Ordering::SeqCst) {
        TestResult::Failed("cancelled timer fired anyway".into())
    } else {
        TestResult::Ok
    }
}

/// Stepping the realtime clock re-bases pending realtime timers: a
/// deadline five wall-clock seconds out fires promptly once the clock is
/// stepped past it.
pub fn realtime_step_rebases_timers() -> TestResult {
    static FIRED: AtomicBool = AtomicBool::new(false);
    FIRED.store(false, Ordering::SeqCst);
    let now_rt = time::kern_now(ClockId::Realtime);
    kernel_timers().register(
        ClockId::Realtime,
        now_rt + seconds(5),
        true,
        None,
        Box::new(|_expiry, overruns| {
            if overruns != TIMER_DISABLED {
                FIRED.store(true, Ordering::SeqCst);
            }
        }),
    );
    thread::sleep(milliseconds(5));
    if FIRED.load(Ordering::SeqCst) {
        return TestResult::Failed("realtime timer fired before its deadline".into());
    }
    time::step_realtime(now_rt + seconds(6));
    if wait_until(seconds(2), || FIRED.load(Ordering::SeqCst)) {
        TestResult::Ok
    } else {
        TestResult::Failed("stepped-past realtime timer never fired".into())
    }
}

pub fn sleep_reaches_deadline() -> TestResult {
    let requested = milliseconds(20);
    let before = time::kern_now(ClockId::Monotonic);
    thread::sleep(requested);
    let elapsed = time::kern_now(ClockId::Monotonic) - before;
    if elapsed >= requested {
        TestResult::Ok
    } else {
        TestResult::Failed(format!("slept {elapsed} ns, requested {requested}"))
    }
}
