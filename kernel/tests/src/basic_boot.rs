#![no_std]
#![no_main]

extern crate alloc;
extern crate uno_kernel;

use alloc::vec::Vec;
use core::panic::PanicInfo;
use uno_kernel::consts::RUNLOOP_TICK_NS;
use uno_kernel::limine_requests::{BASE_REVISION, MEMORY_MAP_REQUEST, MP_REQUEST};
use uno_kernel::sched::{kcontext, runloop, thread};
use uno_kernel::{apic, cpu, env, gdt, interrupt, logger, memory, project_version, time};

#[unsafe(no_mangle)]
unsafe extern "C" fn kernel_main() -> ! {
    assert!(BASE_REVISION.is_supported());

    logger::init().unwrap();
    log::info!("Uno test kernel V:{}", project_version());

    let memory_map = MEMORY_MAP_REQUEST.get_response().unwrap();
    unsafe { memory::init_bsp(memory_map) };
    env::init();

    let mp_response = MP_REQUEST.get_response().unwrap();
    let bsp_lapic_id = mp_response.bsp_lapic_id();
    let mut lapic_ids = Vec::with_capacity(mp_response.cpus().len());
    lapic_ids.push(bsp_lapic_id);
    lapic_ids.extend(
        mp_response
            .cpus()
            .iter()
            .map(|cpu| cpu.lapic_id)
            .filter(|id| *id != bsp_lapic_id),
    );
    cpu::init_cpuinfos(&lapic_ids);

    let ci = unsafe { cpu::install_cpu(0) };
    gdt::init();
    interrupt::idt::init();
    kcontext::init_cpu_contexts(ci);

    time::tsc::calibrate();
    time::init_wall_clock(time::rtc::boot_wall_clock_ns());
    apic::init_local_apic();
    time::lapic_timer::init();

    thread::spawn("test-runner", || uno_tests::run_tests());

    for cpu in mp_response.cpus() {
        if cpu.lapic_id != bsp_lapic_id {
            cpu.goto_address.write(ap_entry);
        }
    }

    time::lapic_timer::set_deadline(RUNLOOP_TICK_NS);
    runloop::runloop()
}

unsafe extern "C" fn ap_entry(limine_cpu: &limine::mp::Cpu) -> ! {
    let id = cpu::cpu_id_for_lapic(limine_cpu.lapic_id).expect("unknown AP lapic id");
    let ci = unsafe { cpu::install_cpu(id) };
    gdt::init();
    interrupt::idt::init();
    kcontext::init_cpu_contexts(ci);
    apic::init_local_apic();
    time::lapic_timer::init();
    time::lapic_timer::set_deadline(RUNLOOP_TICK_NS);
    runloop::runloop()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    uno_tests::test_panic_handler(info)
}
