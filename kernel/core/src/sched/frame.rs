// Machine frame layout. One flat word array per context; the interrupt
// stub and the switch primitives address it by these indices, so the
// order is ABI.

pub const FRAME_RAX: usize = 0;
pub const FRAME_RBX: usize = 1;
pub const FRAME_RCX: usize = 2;
pub const FRAME_RDX: usize = 3;
pub const FRAME_RSI: usize = 4;
pub const FRAME_RDI: usize = 5;
pub const FRAME_RBP: usize = 6;
pub const FRAME_R8: usize = 7;
pub const FRAME_R9: usize = 8;
pub const FRAME_R10: usize = 9;
pub const FRAME_R11: usize = 10;
pub const FRAME_R12: usize = 11;
pub const FRAME_R13: usize = 12;
pub const FRAME_R14: usize = 13;
pub const FRAME_R15: usize = 14;

// iretq image
pub const FRAME_RIP: usize = 15;
pub const FRAME_CS: usize = 16;
pub const FRAME_RFLAGS: usize = 17;
pub const FRAME_RSP: usize = 18;
pub const FRAME_SS: usize = 19;

/// Stack pointer of a voluntarily parked context (callee-saved switch
/// image lives on its stack).
pub const FRAME_SAVED_RSP: usize = 20;
pub const FRAME_STACK_TOP: usize = 21;
/// Nonzero when the GPR/iretq slots hold a complete interrupt-time image;
/// zero when only FRAME_SAVED_RSP is meaningful.
pub const FRAME_FULL: usize = 22;

// fault scratch
pub const FRAME_VECTOR: usize = 23;
pub const FRAME_ERROR_CODE: usize = 24;
pub const FRAME_FAULT_ADDRESS: usize = 25;

pub const FRAME_WORDS: usize = 26;

#[repr(C)]
#[derive(Debug)]
pub struct Frame(pub [u64; FRAME_WORDS]);

impl Frame {
    pub const fn new() -> Frame {
        Frame([0; FRAME_WORDS])
    }

    pub fn is_full(&self) -> bool {
        self.0[FRAME_FULL] != 0
    }

    pub fn set_full(&mut self, full: bool) {
        self.0[FRAME_FULL] = full as u64;
    }

    pub fn stack_top(&self) -> u64 {
        self.0[FRAME_STACK_TOP]
    }

    pub fn set_stack_top(&mut self, top: u64) {
        self.0[FRAME_STACK_TOP] = top;
    }

    pub fn saved_rsp(&self) -> u64 {
        self.0[FRAME_SAVED_RSP]
    }

    pub fn set_saved_rsp(&mut self, rsp: u64) {
        self.0[FRAME_SAVED_RSP] = rsp;
    }

    /// Discard any parked state: the next dispatch starts from a clean
    /// stack. Used when recycling pooled contexts.
    pub fn reset_stack(&mut self) {
        self.0[FRAME_SAVED_RSP] = self.0[FRAME_STACK_TOP];
        self.0[FRAME_FULL] = 0;
    }

    pub fn rip(&self) -> u64 {
        self.0[FRAME_RIP]
    }

    pub fn fault_address(&self) -> u64 {
        self.0[FRAME_FAULT_ADDRESS]
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::new()
    }
}
