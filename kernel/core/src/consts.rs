/// LVT timer register mode field: TSC-deadline.
pub const APIC_TIMER_MODE_TSC_DEADLINE: u32 = 0b10 << 17;

pub const PAGESIZE: usize = 4096;

pub const KERNEL_STACK_SIZE: usize = 64 * 0x400;
pub const SYSCALL_STACK_SIZE: usize = 64 * 0x400;
pub const THREAD_STACK_SIZE: usize = 64 * 0x400;
pub const EXCEPTION_STACK_SIZE: usize = 16 * 0x400;

/// Per-CPU thread run queue depth.
pub const MAX_THREADS: usize = 256;

/// Default preemption tick when no timer expires sooner.
pub const RUNLOOP_TICK_NS: u64 = 1_000_000;
