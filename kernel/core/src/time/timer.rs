use crate::lock::{irq_guarded, lock_pair};
use crate::time::{ClockId, RT_OFFSET_NS, Timestamp, tsc};
use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use alloc::sync::Arc;
use core::cmp::Ordering as CmpOrdering;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Lazy, Mutex};

/// Overrun count passed to a handler when its timer was cancelled before
/// it could fire. Handlers must treat this as "do nothing".
pub const TIMER_DISABLED: u64 = u64::MAX;

/// Invoked from bottom-half context with (expiry, overruns).
pub type TimerHandler = Box<dyn FnMut(Timestamp, u64) + Send>;

struct TimerState {
    disabled: AtomicBool,
}

/// Cancellation handle. Dropping it does not cancel; the reaper invokes
/// the handler once with [`TIMER_DISABLED`] after a cancel.
pub struct Timer {
    state: Arc<TimerState>,
}

impl Timer {
    pub fn cancel(&self) {
        self.state.disabled.store(true, Ordering::Release);
    }
}

struct TimerEntry {
    /// Monotonic deadline; realtime registrations are converted at insert
    /// and re-based on clock steps.
    expiry: Timestamp,
    /// Registration order, so equal expiries fire FIFO.
    seq: u64,
    clock: ClockId,
    period: Option<u64>,
    state: Arc<TimerState>,
    handler: TimerHandler,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed: BinaryHeap is a max-heap, we want earliest (expiry, seq)
    // on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .expiry
            .cmp(&self.expiry)
            .then(other.seq.cmp(&self.seq))
    }
}

pub struct Timerqueue {
    name: &'static str,
    heap: Mutex<BinaryHeap<TimerEntry>>,
    next_seq: AtomicU64,
    /// True while a service thunk is queued or running; guarded by CAS so
    /// at most one is ever in flight.
    service_scheduled: AtomicBool,
}

impl Timerqueue {
    pub fn new(name: &'static str) -> Self {
        Timerqueue {
            name,
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            service_scheduled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a one-shot (`period == None`) or periodic timer.
    /// `expiry` is relative to now unless `absolute`; realtime deadlines
    /// are absolute wall-clock nanoseconds.
    pub fn register(
        &self,
        clock: ClockId,
        expiry: Timestamp,
        absolute: bool,
        period: Option<u64>,
        handler: TimerHandler,
    ) -> Timer {
        let state = Arc::new(TimerState {
            disabled: AtomicBool::new(false),
        });
        let entry_state = state.clone();
        irq_guarded(|| {
            // The offset lock is held across the insert so a concurrent
            // clock step either sees this entry in the heap or computes
            // against the old offset, never half of each.
            let offset = RT_OFFSET_NS.lock();
            let now = tsc::monotonic_now();
            let mono_expiry = match (clock, absolute) {
                (ClockId::Monotonic, true) => expiry,
                (ClockId::Realtime, true) => expiry.saturating_sub(*offset),
                (_, false) => now + expiry,
            };
            let entry = TimerEntry {
                expiry: mono_expiry,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                clock,
                period,
                state: entry_state,
                handler,
            };
            self.heap.lock().push(entry);
        });
        Timer { state }
    }

    /// CAS-guard for the service bottom half: true means the caller must
    /// enqueue the service thunk, false means one is already in flight.
    pub fn try_schedule_service(&self) -> bool {
        self.service_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pop and run every expired timer. Runs in bottom-half context.
    /// Handlers run outside the heap lock so they may re-register.
    pub fn service(&self) {
        // Clear first: an expiry racing with this pass schedules a fresh
        // service rather than being lost.
        self.service_scheduled.store(false, Ordering::Release);
        loop {
            let now = tsc::monotonic_now();
            let entry = irq_guarded(|| {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(e) if e.expiry <= now => heap.pop(),
                    _ => None,
                }
            });
            let Some(mut e) = entry else { break };
            if e.state.disabled.load(Ordering::Acquire) {
                (e.handler)(e.expiry, TIMER_DISABLED);
                continue;
            }
            let overruns = e.period.map_or(0, |p| (now - e.expiry) / p);
            (e.handler)(e.expiry, overruns);
            if let Some(p) = e.period
                && !e.state.disabled.load(Ordering::Acquire)
            {
                // Next deadline computed from the previous one, not from
                // "now": periods do not accumulate drift.
                e.expiry += p * (overruns + 1);
                e.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                irq_guarded(|| self.heap.lock().push(e));
            }
        }
    }

    /// Earliest pending deadline, for re-arming the hardware timer.
    pub fn next_expiry(&self) -> Option<Timestamp> {
        irq_guarded(|| self.heap.lock().peek().map(|e| e.expiry))
    }

    pub fn pending(&self) -> usize {
        irq_guarded(|| self.heap.lock().len())
    }

    /// Apply a realtime clock step: update the offset and shift every
    /// realtime entry's monotonic deadline by the same amount, under both
    /// locks (taken with back-off, see `lock_pair`).
    pub fn rebase_realtime(&self, offset_lock: &Mutex<u64>, new_epoch_ns: Timestamp) {
        irq_guarded(|| {
            let (mut offset, mut heap) = lock_pair(offset_lock, &self.heap);
            let now = tsc::monotonic_now();
            let new_offset = new_epoch_ns.saturating_sub(now);
            let delta = new_offset as i128 - *offset as i128;
            *offset = new_offset;
            let entries = core::mem::take(&mut *heap);
            for mut e in entries {
                if e.clock == ClockId::Realtime {
                    e.expiry = (e.expiry as i128 - delta).max(0) as u64;
                }
                heap.push(e);
            }
        });
    }
}

static KERNEL_TIMERS: Lazy<Timerqueue> = Lazy::new(|| Timerqueue::new("kernel"));

pub fn kernel_timers() -> &'static Timerqueue {
    &KERNEL_TIMERS
}
