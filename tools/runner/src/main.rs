use std::process::Command;
use std::{env, process};

fn main() {
    let iso = env!("ISO");
    if iso.is_empty() {
        eprintln!("no ISO was built; set LIMINE_PATH and rebuild");
        process::exit(1);
    }

    let number_of_cpus = 5;
    let mut qemu = Command::new("qemu-system-x86_64");

    qemu.arg("-cdrom").arg(iso);
    qemu.arg("--smp").arg(number_of_cpus.to_string());
    qemu.arg("--no-reboot");
    qemu.arg("-serial").arg("stdio");
    qemu.arg("-display").arg("none");
    qemu.arg("-device").arg("isa-debug-exit,iobase=0xf4,iosize=0x04");
    // x2apic and invariant-TSC come with the host CPU when KVM is
    // available; fall back to a recent model otherwise.
    if env::var_os("NO_KVM").is_none() {
        qemu.arg("-enable-kvm");
        qemu.arg("-cpu").arg("host");
    } else {
        qemu.arg("-cpu").arg("Skylake-Client-v4,+x2apic");
    }

    let exit_status = qemu.status().expect("Failed to run QEMU");
    // isa-debug-exit reports (code << 1) | 1; 0x10 is the success code.
    process::exit(match exit_status.code() {
        Some(33) => 0,
        Some(code) => code,
        None => 1,
    });
}
