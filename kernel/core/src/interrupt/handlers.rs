use crate::apic;
use crate::consts::RUNLOOP_TICK_NS;
use crate::cpu::{self, CPU_CURRENT_FRAME_OFFSET, CpuState};
use crate::sched::context::Ctx;
use crate::sched::frame::{
    FRAME_CS, FRAME_ERROR_CODE, FRAME_FAULT_ADDRESS, FRAME_FULL, FRAME_R8, FRAME_R9, FRAME_R10,
    FRAME_R11, FRAME_R12, FRAME_R13, FRAME_R14, FRAME_R15, FRAME_RAX, FRAME_RBP, FRAME_RBX,
    FRAME_RCX, FRAME_RDI, FRAME_RDX, FRAME_RFLAGS, FRAME_RIP, FRAME_RSI, FRAME_RSP, FRAME_SS,
    FRAME_VECTOR,
};
use crate::sched::runloop::{runloop_preempt_entry, schedule_timer_service};
use crate::sched::switch::switch_stack;
use crate::sched::thread::ThreadState;
use crate::stats::{count_major_fault, count_minor_fault};
use crate::time::{lapic_timer, timer::kernel_timers, tsc};
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

pub static TIMER_INTERRUPT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Timer interrupt entry.
///
/// Flow:
/// 1. Save all GPRs plus the iretq image into the current context's
///    frame and mark it full.
/// 2. Run the Rust body (timer service scheduling, re-arm, EOI).
/// 3. The body returns 0 to resume the interrupted context, or the
///    kernel-context stack top to preempt: the interrupted thread is
///    already requeued, so switch stacks and fall into the runloop.
#[unsafe(naked)]
pub unsafe extern "C" fn timer_interrupt_handler() {
    core::arch::naked_asm!(
        "push r11",
        "mov r11, gs:[{cur_frame}]",
        "test r11, r11",
        "jz 2f",

        "mov [r11 + {RAX}], rax",
        "mov [r11 + {RBX}], rbx",
        "mov [r11 + {RCX}], rcx",
        "mov [r11 + {RDX}], rdx",
        "mov [r11 + {RSI}], rsi",
        "mov [r11 + {RDI}], rdi",
        "mov [r11 + {RBP}], rbp",
        "mov [r11 + {R8}], r8",
        "mov [r11 + {R9}], r9",
        "mov [r11 + {R10}], r10",
        "mov rax, [rsp]", // original r11
        "mov [r11 + {R11}], rax",
        "mov [r11 + {R12}], r12",
        "mov [r11 + {R13}], r13",
        "mov [r11 + {R14}], r14",
        "mov [r11 + {R15}], r15",
        // hardware iretq image sits above the pushed r11
        "mov rax, [rsp + 8]",
        "mov [r11 + {RIP}], rax",
        "mov rax, [rsp + 16]",
        "mov [r11 + {CS}], rax",
        "mov rax, [rsp + 24]",
        "mov [r11 + {RFLAGS}], rax",
        "mov rax, [rsp + 32]",
        "mov [r11 + {RSP}], rax",
        "mov rax, [rsp + 40]",
        "mov [r11 + {SS}], rax",
        "mov qword ptr [r11 + {FULL}], 1",

        "call {inner}",
        "test rax, rax",
        "jnz 3f",

        // resume the interrupted context
        "mov r11, gs:[{cur_frame}]",
        "mov qword ptr [r11 + {FULL}], 0",
        "mov rax, [r11 + {R11}]",
        "mov [rsp], rax",
        "mov rax, [r11 + {RAX}]",
        "mov rbx, [r11 + {RBX}]",
        "mov rcx, [r11 + {RCX}]",
        "mov rdx, [r11 + {RDX}]",
        "mov rsi, [r11 + {RSI}]",
        "mov rdi, [r11 + {RDI}]",
        "mov rbp, [r11 + {RBP}]",
        "mov r8, [r11 + {R8}]",
        "mov r9, [r11 + {R9}]",
        "mov r10, [r11 + {R10}]",
        "mov r12, [r11 + {R12}]",
        "mov r13, [r11 + {R13}]",
        "mov r14, [r11 + {R14}]",
        "mov r15, [r11 + {R15}]",
        "pop r11",
        "iretq",

        // preempt: rax holds the kernel context stack top
        "3:",
        "mov rsp, rax",
        "jmp {preempt}",

        // no context installed: a timer interrupt this early is a bug
        "2:",
        "jmp {too_early}",

        cur_frame = const CPU_CURRENT_FRAME_OFFSET,
        RAX = const FRAME_RAX * 8,
        RBX = const FRAME_RBX * 8,
        RCX = const FRAME_RCX * 8,
        RDX = const FRAME_RDX * 8,
        RSI = const FRAME_RSI * 8,
        RDI = const FRAME_RDI * 8,
        RBP = const FRAME_RBP * 8,
        R8 = const FRAME_R8 * 8,
        R9 = const FRAME_R9 * 8,
        R10 = const FRAME_R10 * 8,
        R11 = const FRAME_R11 * 8,
        R12 = const FRAME_R12 * 8,
        R13 = const FRAME_R13 * 8,
        R14 = const FRAME_R14 * 8,
        R15 = const FRAME_R15 * 8,
        RIP = const FRAME_RIP * 8,
        CS = const FRAME_CS * 8,
        RFLAGS = const FRAME_RFLAGS * 8,
        RSP = const FRAME_RSP * 8,
        SS = const FRAME_SS * 8,
        FULL = const FRAME_FULL * 8,
        inner = sym timer_interrupt_inner,
        preempt = sym runloop_preempt_entry,
        too_early = sym timer_interrupt_too_early,
    );
}

extern "C" fn timer_interrupt_too_early() -> ! {
    panic!("timer interrupt before cpu initialization");
}

/// Rust body of the timer interrupt. Returns 0 to resume the interrupted
/// context, or the kernel-context stack top to preempt into the runloop.
extern "C" fn timer_interrupt_inner() -> u64 {
    TIMER_INTERRUPT_COUNT.fetch_add(1, Ordering::Relaxed);
    let ci = cpu::current_cpu();
    let prev = ci.state.load(Ordering::Relaxed);
    ci.state.store(CpuState::Interrupt, Ordering::Relaxed);

    let now = tsc::monotonic_now();
    ci.last_timer_update.store(now, Ordering::Relaxed);
    schedule_timer_service();

    // Re-arm to the next timer expiry, capped at the default tick.
    let mut tick = RUNLOOP_TICK_NS;
    if let Some(expiry) = kernel_timers().next_expiry() {
        tick = tick.min(expiry.saturating_sub(now).max(10_000));
    }
    lapic_timer::set_deadline(tick);
    apic::eoi();

    if prev == CpuState::User {
        // Preempt only application thread code; kernel-state code (which
        // may hold spinlocks) always resumes.
        let t = ci
            .current_context()
            .as_thread()
            .expect("user state without a thread context");
        t.state.store(ThreadState::Ready, Ordering::Release);
        if ci.thread_queue.enqueue(t).is_ok() {
            return ci.m.runloop_stack_top.load(Ordering::Acquire);
        }
        // run queue full: let it keep its slice
        t.state.store(ThreadState::Running, Ordering::Relaxed);
    }
    ci.state.store(prev, Ordering::Relaxed);
    0
}

pub extern "x86-interrupt" fn reschedule_handler(_stack_frame: InterruptStackFrame) {
    // wake only: the runloop finds whatever was queued
    apic::eoi();
}

pub extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {}

pub extern "x86-interrupt" fn apic_error_handler(_stack_frame: InterruptStackFrame) {
    log::error!("local apic error");
    apic::eoi();
}

pub extern "x86-interrupt" fn cpu_message_handler(_stack_frame: InterruptStackFrame) {
    let ci = cpu::current_cpu();
    let prev = ci.state.load(Ordering::Relaxed);
    ci.state.store(CpuState::Interrupt, Ordering::Relaxed);
    while let Some(thunk) = ci.cpu_queue.dequeue() {
        thunk();
    }
    ci.state.store(prev, Ordering::Relaxed);
    apic::eoi();
}

pub extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::info!("breakpoint at {:#x}", stack_frame.instruction_pointer.as_u64());
}

pub extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!("double fault! stack frame: {stack_frame:#?}, error code: {error_code}")
}

pub extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fault_dispatch(13, error_code, 0, &stack_frame);
    panic!("general protection fault! stack frame: {stack_frame:#?}, error code: {error_code}")
}

pub extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let accessed = Cr2::read_raw();
    if error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        count_minor_fault();
    } else {
        count_major_fault();
    }
    fault_dispatch(14, error_code.bits(), accessed, &stack_frame);
    panic!(
        "unhandled page fault at {:#x}, error: {error_code:#?}, ip: {:#x}",
        accessed,
        stack_frame.instruction_pointer.as_u64()
    );
}

/// Route a fault through the current context: a fault handler may fix up
/// and resume; a handler-less thread fault kills the thread; a
/// handler-less kernel fault falls back to the caller's panic.
fn fault_dispatch(vector: u64, error_code: u64, fault_address: u64, stack_frame: &InterruptStackFrame) {
    let Some(ci) = cpu::try_current_cpu() else { return };
    let Some(ctx) = ci.try_current_context() else { return };

    let frame = unsafe { ctx.context().frame() };
    frame.0[FRAME_VECTOR] = vector;
    frame.0[FRAME_ERROR_CODE] = error_code;
    frame.0[FRAME_FAULT_ADDRESS] = fault_address;
    frame.0[FRAME_RIP] = stack_frame.instruction_pointer.as_u64();

    if let Some(mut handler) = ctx.context().take_fault_handler()
        && handler(frame)
    {
        return;
    }

    if let Some(t) = ctx.as_thread() {
        // No handler: the fault is fatal for the thread but not the
        // machine. Tear it down and drive the runloop.
        log::error!(
            "thread {} ({}) faulted: vector {} error {:#x} addr {:#x} ip {:#x}",
            t.id(),
            t.name(),
            vector,
            error_code,
            fault_address,
            frame.0[FRAME_RIP],
        );
        kill_current_thread(t);
    }
}

fn kill_current_thread(t: &'static crate::sched::thread::ThreadContext) -> ! {
    let ci = cpu::current_cpu();
    t.state.store(ThreadState::Zombie, Ordering::Release);
    let retired: Ctx = t;
    ci.set_retiring(retired);
    let top = ci.m.runloop_stack_top.load(Ordering::Acquire);
    unsafe { switch_stack(top, runloop_preempt_entry) }
}
