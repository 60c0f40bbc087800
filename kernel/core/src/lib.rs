#![no_std]
#![feature(abi_x86_interrupt)]
extern crate alloc;

pub mod apic;
pub mod blockq;
pub mod consts;
pub mod cpu;
pub mod env;
pub mod errno;
pub mod gdt;
pub mod interrupt;
pub mod limine_requests;
pub mod lock;
pub mod logger;
pub mod memory;
pub mod notify;
pub mod queue;
pub mod sched;
pub mod stats;
pub mod time;
pub mod unix;

use core::sync::atomic::{AtomicBool, Ordering};

/// Once set, context pause/resume hooks are skipped so a wedged context
/// cannot stall the shutdown path.
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

pub fn shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::Relaxed)
}

pub fn begin_shutdown() {
    SHUTTING_DOWN.store(true, Ordering::Release);
}

pub fn project_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}
