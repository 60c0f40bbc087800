#![no_std]
extern crate alloc;

use alloc::string::String;
use core::panic::PanicInfo;
use uno_kernel::hlt_loop;

pub mod blockq;
pub mod context;
pub mod runloop;
pub mod timer;

pub fn test_panic_handler(info: &PanicInfo) -> ! {
    log::error!("[failed]");
    log::error!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed);
    hlt_loop();
}

// Custom test harness
pub trait KernelTest {
    fn name(&self) -> &'static str;
    fn run(&self) -> TestResult;
}

impl<F> KernelTest for F
where
    F: Fn() -> TestResult,
{
    fn name(&self) -> &'static str {
        core::any::type_name::<F>()
    }

    fn run(&self) -> TestResult {
        self()
    }
}

#[derive(Debug)]
pub enum TestResult {
    Ok,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestGroup {
    Queue,
    Context,
    Timer,
    Runloop,
    Blockq,
    Pipe,
    Stats,
}

pub struct TestEntry {
    pub group: TestGroup,
    pub test: &'static dyn KernelTest,
}

pub fn parse_test_group(cmdline: &[u8]) -> Option<TestGroup> {
    let s = core::str::from_utf8(cmdline).ok()?;
    let prefix = "test_suite=";
    let pos = s.find(prefix)?;
    let value = s[pos + prefix.len()..].split_whitespace().next()?;
    match value {
        "queue" => Some(TestGroup::Queue),
        "context" => Some(TestGroup::Context),
        "timer" => Some(TestGroup::Timer),
        "runloop" => Some(TestGroup::Runloop),
        "blockq" => Some(TestGroup::Blockq),
        "pipe" => Some(TestGroup::Pipe),
        "stats" => Some(TestGroup::Stats),
        _ => None,
    }
}

pub fn tests() -> &'static [TestEntry] {
    &[
        // Queues
        TestEntry { group: TestGroup::Queue, test: &queue::fifo_order },
        TestEntry { group: TestGroup::Queue, test: &queue::capacity_bound },
        TestEntry { group: TestGroup::Queue, test: &queue::irqsafe_variants },

        // Context fabric
        TestEntry { group: TestGroup::Context, test: &context::acquire_excludes_concurrent_owners },
        TestEntry { group: TestGroup::Context, test: &context::kernel_context_pool_recycles },
        TestEntry { group: TestGroup::Context, test: &context::spawned_threads_all_run },

        // Timerqueue
        TestEntry { group: TestGroup::Timer, test: &timer::one_shot_fires },
        TestEntry { group: TestGroup::Timer, test: &timer::periodic_expiry_has_no_drift },
        TestEntry { group: TestGroup::Timer, test: &timer::equal_expiries_fire_in_registration_order },
        TestEntry { group: TestGroup::Timer, test: &timer::cancelled_timer_does_not_fire },
        TestEntry { group: TestGroup::Timer, test: &timer::realtime_step_rebases_timers },
        TestEntry { group: TestGroup::Timer, test: &timer::sleep_reaches_deadline },

        // Runloop
        TestEntry { group: TestGroup::Runloop, test: &runloop::timer_interrupt_fires },
        TestEntry { group: TestGroup::Runloop, test: &runloop::bottom_half_runs_before_thread },
        TestEntry { group: TestGroup::Runloop, test: &runloop::async1_runs_after_bottom_halves },
        TestEntry { group: TestGroup::Runloop, test: &runloop::cross_cpu_thunks_run },

        // Blockq
        TestEntry { group: TestGroup::Blockq, test: &blockq::wake_reinvokes_and_reparks },
        TestEntry { group: TestGroup::Blockq, test: &blockq::flush_nullifies_all_waiters },
        TestEntry { group: TestGroup::Blockq, test: &blockq::timeout_delivers_timedout },

        // Pipe
        TestEntry { group: TestGroup::Pipe, test: &pipe::blocking_read_unblocked_by_write },
        TestEntry { group: TestGroup::Pipe, test: &pipe::nonblocking_read_returns_eagain },
        TestEntry { group: TestGroup::Pipe, test: &pipe::writer_close_reads_eof },
        TestEntry { group: TestGroup::Pipe, test: &pipe::reader_close_write_epipe },
        TestEntry { group: TestGroup::Pipe, test: &pipe::capacity_clamps_to_one_page },
        TestEntry { group: TestGroup::Pipe, test: &pipe::capacity_shrink_below_buffered_is_busy },
        TestEntry { group: TestGroup::Pipe, test: &pipe::flush_cancels_blocked_readers },
        TestEntry { group: TestGroup::Pipe, test: &pipe::edge_triggered_notify_dispatch },
        TestEntry { group: TestGroup::Pipe, test: &pipe::events_follow_buffer_and_peer_state },

        // Stats
        TestEntry { group: TestGroup::Stats, test: &stats::fault_counters_are_monotonic },
        TestEntry { group: TestGroup::Stats, test: &stats::idle_cpus_show_in_mask },
    ]
}

/// Runs in a spawned thread so blocking paths are usable. Exits QEMU with
/// the aggregate result.
pub fn run_tests() -> ! {
    // give the APs a moment to come online so cross-CPU tests see them
    let want = uno_kernel::cpu::cpus_count();
    let up = |n: usize| {
        (0..n as u32)
            .filter(|id| uno_kernel::cpu::try_get_ready_cpu(*id).is_some())
            .count()
    };
    wait_until(uno_kernel::time::seconds(2), || up(want) == want);
    log::info!("{} of {want} CPUs online", up(want));

    let filter = parse_test_group(uno_kernel::env::cmdline());
    let all = tests();
    let selected = all
        .iter()
        .filter(|e| filter.is_none_or(|g| e.group == g))
        .count();
    log::info!("Running {selected} kernel tests");

    let mut failed = 0;
    for entry in all {
        if let Some(group) = filter
            && entry.group != group
        {
            continue;
        }
        log::info!("{}:", entry.test.name());
        match entry.test.run() {
            TestResult::Ok => log::info!("\x1b[32m[ok]\x1b[0m"),
            TestResult::Failed(msg) => {
                failed += 1;
                log::error!("[failed] {msg}");
            }
        }
    }

    uno_kernel::begin_shutdown();
    uno_kernel::apic::wakeup_or_interrupt_cpu_all();
    if failed == 0 {
        exit_qemu(QemuExitCode::Success);
    } else {
        log::error!("{failed} tests failed");
        exit_qemu(QemuExitCode::Failed);
    }
    hlt_loop();
}

/// Yield-poll until `pred` holds or `timeout_ns` elapses.
pub fn wait_until(timeout_ns: u64, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = uno_kernel::time::tsc::monotonic_now() + timeout_ns;
    while !pred() {
        if uno_kernel::time::tsc::monotonic_now() > deadline {
            return false;
        }
        uno_kernel::sched::thread::yield_now();
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    unsafe {
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
}
