use core::sync::atomic::{AtomicBool, Ordering};
use lock_api::{GuardSend, RawMutex};
use spin::Mutex;
use spin::mutex::MutexGuard;
use x86_64::instructions::interrupts;

/// Run `f` with interrupts disabled, restoring the previous state after.
/// Used around every queue operation reachable from both thread and
/// interrupt context.
#[inline]
pub fn irq_guarded<R>(f: impl FnOnce() -> R) -> R {
    interrupts::without_interrupts(f)
}

/// Spinlock that disables interrupts for the duration of the hold, so a
/// holder can never be preempted while contenders spin. Backs the global
/// allocator, which is reachable from preemptible thread code.
pub struct RawIrqSpin {
    locked: AtomicBool,
    reenable: AtomicBool,
}

unsafe impl RawMutex for RawIrqSpin {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawIrqSpin = RawIrqSpin {
        locked: AtomicBool::new(false),
        reenable: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        // interrupts must go off before the acquire, or a preemption in
        // between leaves the lock held by a descheduled context
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.reenable.store(was_enabled, Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.reenable.store(was_enabled, Ordering::Relaxed);
            true
        } else {
            if was_enabled {
                interrupts::enable();
            }
            false
        }
    }

    unsafe fn unlock(&self) {
        let reenable = self.reenable.load(Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        if reenable {
            interrupts::enable();
        }
    }
}

/// Acquire two locks without a global ordering: hold the first, try the
/// second, and back off (releasing the first) whenever the second is
/// contended, so two callers taking the pair in opposite order cannot
/// deadlock.
pub fn lock_pair<'a, A, B>(
    a: &'a Mutex<A>,
    b: &'a Mutex<B>,
) -> (MutexGuard<'a, A>, MutexGuard<'a, B>) {
    loop {
        let ga = a.lock();
        match b.try_lock() {
            Some(gb) => return (ga, gb),
            None => {
                drop(ga);
                core::hint::spin_loop();
            }
        }
    }
}
