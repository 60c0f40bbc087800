//! Stack-switch primitives. Everything here deals in the callee-saved
//! switch image or the full frame of `sched::frame`; logging is not
//! allowed in any of these paths.

use crate::sched::frame::{
    FRAME_CS, FRAME_FULL, FRAME_R8, FRAME_R9, FRAME_R10, FRAME_R11, FRAME_R12, FRAME_R13,
    FRAME_R14, FRAME_R15, FRAME_RAX, FRAME_RBP, FRAME_RBX, FRAME_RCX, FRAME_RDI, FRAME_RDX,
    FRAME_RFLAGS, FRAME_RIP, FRAME_RSI, FRAME_RSP, FRAME_SS,
};

/// Assembly: push the callee-saved switch image. Must mirror
/// `restore_switch_frame!`.
#[macro_export]
macro_rules! save_switch_frame {
    () => {
        r#"
            push rbx
            push rbp
            push r12
            push r13
            push r14
            push r15
            pushfq
        "#
    };
}

/// Assembly: pop the callee-saved switch image.
#[macro_export]
macro_rules! restore_switch_frame {
    () => {
        r#"
            popfq
            pop r15
            pop r14
            pop r13
            pop r12
            pop rbp
            pop rbx
        "#
    };
}

/// Park the current context and run `entry` on a fresh stack.
///
/// The callee-saved image is pushed onto the current stack and the
/// resulting stack pointer stored through `save_slot` (the context's
/// FRAME_SAVED_RSP word); a later [`jump_to_saved`] on that value returns
/// from this call.
///
/// # Safety
/// `save_slot` must point into the current context's frame, `new_rsp`
/// must be the top of a live, unused stack, and `entry` must not return.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_and_call(
    save_slot: *mut u64,
    new_rsp: u64,
    entry: extern "C" fn() -> !,
) {
    core::arch::naked_asm!(
        "push [rsp]", // return address doubles as the resume rip
        save_switch_frame!(),
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "jmp rdx",
    );
}

/// Resume a context parked by [`switch_and_call`]. The current stack is
/// abandoned.
///
/// # Safety
/// `saved_rsp` must hold a switch image written by `switch_and_call`, and
/// the owning context must have been acquired by this CPU.
#[unsafe(naked)]
pub unsafe extern "C" fn jump_to_saved(saved_rsp: u64) -> ! {
    core::arch::naked_asm!(
        "mov rsp, rdi",
        restore_switch_frame!(),
        "add rsp, 8", // discard the duplicated rip slot
        "ret",
    );
}

/// Jump to `entry` on a fresh stack without saving anything.
///
/// # Safety
/// The current stack is abandoned; `entry` must not return.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_stack(new_rsp: u64, entry: extern "C" fn() -> !) -> ! {
    core::arch::naked_asm!("mov rsp, rdi", "xor rbp, rbp", "jmp rsi");
}

/// Return into a full interrupt-time frame via iretq. Restores every GPR
/// and the interrupt flag from the frame.
///
/// # Safety
/// Interrupts must be disabled; `frame` must hold a full image
/// (FRAME_FULL set) for a context acquired by this CPU.
#[unsafe(naked)]
pub unsafe extern "C" fn frame_return(frame: *const u64) -> ! {
    core::arch::naked_asm!(
        "mov r11, rdi",
        // iretq image, pushed onto the current (soon abandoned) stack
        "push [r11 + {SS}]",
        "push [r11 + {RSP}]",
        "push [r11 + {RFLAGS}]",
        "push [r11 + {CS}]",
        "push [r11 + {RIP}]",
        "mov qword ptr [r11 + {FULL}], 0",
        "push [r11 + {RAX}]", // staged; popped right before iretq
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
        "mov r11, [r11 + {R11}]",
        "pop rax",
        "iretq",
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
    );
}
