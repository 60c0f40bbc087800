use core::arch::x86_64::{__cpuid, __rdtscp, _mm_lfence, _rdtsc};
use core::sync::atomic::{AtomicU64, Ordering};
use raw_cpuid::CpuId;

pub static TSC_HZ: AtomicU64 = AtomicU64::new(0);

/// Used until calibration has run, and when the hypervisor exposes no
/// frequency information at all.
const FALLBACK_TSC_HZ: u64 = 1_000_000_000;

pub fn value() -> u64 {
    if has_rdtscp() {
        let mut aux = 0;
        unsafe { __rdtscp(&mut aux) }
    } else {
        unsafe {
            _mm_lfence();
            _rdtsc()
        }
    }
}

fn has_rdtscp() -> bool {
    let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;
    if max_ext < 0x8000_0001 {
        return false;
    }
    let res = unsafe { __cpuid(0x8000_0001) };
    (res.edx & (1 << 27)) != 0
}

fn frequency_from_cpuid() -> Option<u64> {
    let cpuid = CpuId::new();
    if let Some(info) = cpuid.get_tsc_info() {
        if let Some(hz) = info.tsc_frequency() {
            return Some(hz);
        }
    }
    // Hypervisors commonly report the base frequency here instead.
    cpuid
        .get_processor_frequency_info()
        .map(|f| f.processor_base_frequency() as u64 * 1_000_000)
        .filter(|hz| *hz != 0)
}

/// Must run once during early boot, before the first timer deadline is
/// programmed.
pub fn calibrate() {
    let hz = match frequency_from_cpuid() {
        Some(hz) => hz,
        None => {
            log::warn!("no TSC frequency from cpuid, assuming {} Hz", FALLBACK_TSC_HZ);
            FALLBACK_TSC_HZ
        }
    };
    log::info!("TSC running at {} Hz", hz);
    TSC_HZ.store(hz, Ordering::SeqCst);
}

fn hz() -> u64 {
    match TSC_HZ.load(Ordering::Relaxed) {
        0 => FALLBACK_TSC_HZ,
        hz => hz,
    }
}

/// Nanoseconds since boot, from the calibrated TSC. Monotonicity is the
/// only property callers rely on.
pub fn monotonic_now() -> u64 {
    ticks_to_ns(value())
}

pub fn ticks_to_ns(ticks: u64) -> u64 {
    (ticks as u128 * 1_000_000_000 / hz() as u128) as u64
}

pub fn ns_to_ticks(ns: u64) -> u64 {
    (ns as u128 * hz() as u128 / 1_000_000_000) as u64
}
