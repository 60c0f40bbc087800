use crate::consts::APIC_TIMER_MODE_TSC_DEADLINE;
use crate::interrupt::InterruptVector;
use crate::time::tsc;
use x86::msr::{IA32_TSC_DEADLINE, IA32_X2APIC_LVT_TIMER, wrmsr};

/// Put the local APIC timer into TSC-deadline mode, routed to the timer
/// vector. Must run on every CPU after its local APIC is enabled.
pub fn init() {
    unsafe {
        wrmsr(
            IA32_X2APIC_LVT_TIMER,
            u8::from(InterruptVector::LocalApicTimer) as u64 | APIC_TIMER_MODE_TSC_DEADLINE as u64,
        );
    }
}

/// Arm the deadline `nanoseconds` from now. Writing the MSR replaces any
/// previously armed deadline.
pub fn set_deadline(nanoseconds: u64) {
    unsafe {
        wrmsr(IA32_TSC_DEADLINE, tsc::value() + tsc::ns_to_ticks(nanoseconds));
    }
}
