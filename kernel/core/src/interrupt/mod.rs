use num_enum::IntoPrimitive;

pub mod handlers;
pub mod idt;

#[derive(Debug, Clone, Copy, IntoPrimitive)]
#[repr(u8)]
pub enum InterruptVector {
    LocalApicSpurious = 0x20,
    LocalApicTimer,
    LocalApicError,
    Reschedule,
    CpuMessage,
}
