use core::sync::atomic::{AtomicU64, Ordering};

/// Process-wide memory accounting. Counters are monotonic non-decreasing;
/// the management layer reads them, nothing in the core consumes them.
pub struct MmStats {
    pub minor_faults: AtomicU64,
    pub major_faults: AtomicU64,
}

pub static MM_STATS: MmStats = MmStats {
    minor_faults: AtomicU64::new(0),
    major_faults: AtomicU64::new(0),
};

#[inline]
pub fn count_minor_fault() {
    MM_STATS.minor_faults.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn count_major_fault() {
    MM_STATS.major_faults.fetch_add(1, Ordering::Relaxed);
}

/// Bitmap of CPUs parked in `wait_for_interrupt`. The scheduler consults
/// this when it wants a wake target for a newly runnable thread.
pub static IDLE_CPU_MASK: AtomicU64 = AtomicU64::new(0);

pub fn set_cpu_idle(cpu: u32) {
    IDLE_CPU_MASK.fetch_or(1 << cpu, Ordering::Release);
}

pub fn clear_cpu_idle(cpu: u32) {
    IDLE_CPU_MASK.fetch_and(!(1 << cpu), Ordering::Release);
}

/// Lowest-numbered idle CPU, if any.
pub fn pick_idle_cpu() -> Option<u32> {
    let mask = IDLE_CPU_MASK.load(Ordering::Acquire);
    if mask == 0 { None } else { Some(mask.trailing_zeros()) }
}
