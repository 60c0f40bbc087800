#![no_std]
#![no_main]

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use uno_kernel::consts::RUNLOOP_TICK_NS;
use uno_kernel::limine_requests::{BASE_REVISION, MEMORY_MAP_REQUEST, MP_REQUEST};
use uno_kernel::sched::{kcontext, runloop, thread};
use uno_kernel::stats::MM_STATS;
use uno_kernel::unix::fd::OpenFlags;
use uno_kernel::{apic, cpu, env, gdt, hlt_loop, interrupt, logger, memory, project_version, time, unix};

#[unsafe(no_mangle)]
unsafe extern "C" fn kernel_main() -> ! {
    assert!(BASE_REVISION.is_supported());

    logger::init().unwrap();
    log::info!("Welcome to Uno! V:{}", project_version());

    let memory_map = MEMORY_MAP_REQUEST.get_response().unwrap();
    unsafe { memory::init_bsp(memory_map) };
    env::init();
    log::info!("BSP memory initialized.");

    // cpu 0 is always the BSP; APs follow in enumeration order
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

    thread::spawn("init", init_thread_main);

    for cpu in mp_response.cpus() {
        if cpu.lapic_id != bsp_lapic_id {
            cpu.goto_address.write(ap_entry);
        }
    }

    log::info!("BSP entering runloop");
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
    log::info!("cpu {} online", id);
    runloop::runloop()
}

/// The application entry thread: prove the I/O path end to end, then tick
/// over reporting accounting.
fn init_thread_main() {
    let (rfd, wfd) = unix::pipe2(OpenFlags::empty()).expect("pipe2 failed");
    thread::spawn("greeter", move || {
        unix::write(wfd, b"hello from uno\n").expect("pipe write failed");
    });

    let mut buf = [0u8; 64];
    let n = unix::read(rfd, &mut buf).expect("pipe read failed");
    match core::str::from_utf8(&buf[..n]) {
        Ok(s) => log::info!("init read {n} bytes: {}", s.trim_end()),
        Err(_) => log::warn!("init read {n} non-utf8 bytes"),
    }
    unix::close(rfd).unwrap();
    unix::close(wfd).unwrap();

    loop {
        thread::sleep(time::seconds(10));
        log::info!(
            "up: minor faults {}, major faults {}",
            MM_STATS.minor_faults.load(Ordering::Relaxed),
            MM_STATS.major_faults.load(Ordering::Relaxed),
        );
    }
}

static DID_PANIC: AtomicBool = AtomicBool::new(false);

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    if !DID_PANIC.swap(true, Ordering::Relaxed) {
        log::error!("{info}");
    }
    hlt_loop();
}
