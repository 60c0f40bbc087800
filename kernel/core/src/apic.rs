use crate::cpu::{self, CpuInfo, CpuThunk};
use crate::interrupt::InterruptVector;
use core::cell::UnsafeCell;
use force_send_sync::SendSync;
use raw_cpuid::CpuId;
use x2apic::lapic::{LocalApic, LocalApicBuilder};

fn cpu_has_x2apic() -> bool {
    CpuId::new().get_feature_info().is_some_and(|f| f.has_x2apic())
}

/// Build and enable this CPU's local APIC. x2APIC only: the Limine MP
/// request already asked the firmware for x2APIC operation.
pub fn init_local_apic() {
    assert!(cpu_has_x2apic(), "x2apic support required");
    cpu::current_cpu().local_apic.call_once(|| {
        let local_apic = {
            let mut builder = LocalApicBuilder::new();
            builder
                .spurious_vector(u8::from(InterruptVector::LocalApicSpurious).into())
                .error_vector(u8::from(InterruptVector::LocalApicError).into())
                .timer_vector(u8::from(InterruptVector::LocalApicTimer).into());
            let mut local_apic = builder.build().unwrap();
            unsafe { local_apic.enable() }
            // The builder arms a periodic timer by default; mask it until
            // the TSC-deadline timer is programmed.
            unsafe { local_apic.disable_timer() }
            local_apic
        };
        UnsafeCell::new(unsafe { SendSync::new(local_apic) })
    });
}

fn with_local_apic<R>(f: impl FnOnce(&mut LocalApic) -> R) -> R {
    let cell = cpu::current_cpu()
        .local_apic
        .get()
        .expect("local apic not initialized");
    // Safety: per-CPU cell, only touched by its own CPU.
    let lapic = unsafe { &mut *cell.get() };
    f(&mut *lapic)
}

pub fn eoi() {
    with_local_apic(|lapic| unsafe { lapic.end_of_interrupt() })
}

pub fn send_fixed_ipi(apic_id: u32, vector: u8) {
    with_local_apic(|lapic| unsafe { lapic.send_ipi(vector, apic_id) })
}

pub fn send_reschedule_ipi(apic_id: u32) {
    send_fixed_ipi(apic_id, InterruptVector::Reschedule.into());
}

/// Queue a thunk on another CPU and interrupt it; the thunk runs in that
/// CPU's interrupt context.
pub fn send_cpu_thunk(target: &'static CpuInfo, thunk: CpuThunk) -> Result<(), CpuThunk> {
    target.cpu_queue.enqueue_irqsafe(thunk)?;
    send_fixed_ipi(target.local_apic_id, InterruptVector::CpuMessage.into());
    Ok(())
}

/// Kick every other CPU out of wait_for_interrupt.
pub fn wakeup_or_interrupt_cpu_all() {
    let local = cpu::current_cpu();
    for id in 0..cpu::cpus_count() as u32 {
        if id != local.id
            && let Some(ci) = cpu::try_get_ready_cpu(id)
        {
            send_reschedule_ipi(ci.local_apic_id);
        }
    }
}
