pub mod lapic_timer;
pub mod rtc;
pub mod timer;
pub mod tsc;

use spin::Mutex;

/// All core timestamps are nanoseconds.
pub type Timestamp = u64;

pub const fn microseconds(n: u64) -> Timestamp {
    n * 1_000
}

pub const fn milliseconds(n: u64) -> Timestamp {
    n * 1_000_000
}

pub const fn seconds(n: u64) -> Timestamp {
    n * 1_000_000_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    Monotonic,
    Realtime,
}

/// realtime = monotonic + offset. Guarded by a lock rather than an atomic
/// because clock steps must be made atomic with the re-basing of realtime
/// timers (see [`step_realtime`]).
pub(crate) static RT_OFFSET_NS: Mutex<u64> = Mutex::new(0);

pub fn kern_now(id: ClockId) -> Timestamp {
    let mono = tsc::monotonic_now();
    match id {
        ClockId::Monotonic => mono,
        ClockId::Realtime => mono + crate::lock::irq_guarded(|| *RT_OFFSET_NS.lock()),
    }
}

/// Called once at boot with the RTC-derived wall clock.
pub fn init_wall_clock(epoch_ns: Timestamp) {
    crate::lock::irq_guarded(|| {
        *RT_OFFSET_NS.lock() = epoch_ns.saturating_sub(tsc::monotonic_now());
    });
}

/// Step the realtime clock to `epoch_ns`. Pending realtime timers keep
/// their wall-clock deadlines, so their monotonic expiries shift by the
/// step; the offset update and the timer re-base happen under both locks
/// so no service pass observes a half-applied step.
pub fn step_realtime(epoch_ns: Timestamp) {
    timer::kernel_timers().rebase_realtime(&RT_OFFSET_NS, epoch_ns);
}
