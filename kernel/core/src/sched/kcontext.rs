use crate::consts::{KERNEL_STACK_SIZE, SYSCALL_STACK_SIZE};
use crate::cpu::{self, CpuInfo, CpuState};
use crate::lock::irq_guarded;
use crate::memory::stack::Stack;
use crate::sched::context::{Context, ContextKind, ContextVariant, context_resume};
use alloc::boxed::Box;
use core::sync::atomic::Ordering;
use spin::Mutex;

/// Kernel-variant context: the runloop's home and the vehicle for any
/// kernel-side work that needs its own stack. Never made runnable through
/// the thread run queue.
pub struct KernelContext {
    ctx: Context,
    stack: Stack,
}

impl KernelContext {
    /// Fresh context with its own stack, refcount 1, no fault handler.
    pub fn allocate() -> &'static KernelContext {
        let stack = Stack::new(KERNEL_STACK_SIZE);
        let ctx = Context::new(ContextKind::Kernel, stack.top());
        Box::leak(Box::new(KernelContext { ctx, stack }))
    }

    /// Pool lookup with allocation fallback; recycled contexts come back
    /// with a clean stack and a fresh reference.
    pub fn get(ci: &CpuInfo) -> &'static KernelContext {
        match irq_guarded(|| ci.free_kernel_contexts.lock().pop()) {
            Some(kc) => {
                unsafe { kc.ctx.frame() }.reset_stack();
                kc.ctx.reset_refs();
                kc
            }
            None => Self::allocate(),
        }
    }

    pub fn stack_top(&self) -> u64 {
        self.stack.top()
    }
}

impl ContextVariant for KernelContext {
    fn context(&self) -> &Context {
        &self.ctx
    }

    // Recycled to the current CPU's free list, never back to the heap:
    // allocation work on hot paths stays bounded.
    fn on_recycle(&'static self) {
        let ci = cpu::current_cpu();
        irq_guarded(|| ci.free_kernel_contexts.lock().push(self));
    }
}

/// Syscall-variant context: borrowed from the per-CPU pool for the
/// duration of one potentially blocking kernel operation. When the
/// operation suspends in a blockq the stack is simply abandoned (the
/// pending action owns all remaining state) and the context recycles.
pub struct SyscallContext {
    ctx: Context,
    stack: Stack,
    /// Operation staged by `syscall_enter` for the trampoline to run.
    pub(crate) op: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SyscallContext {
    pub fn allocate() -> &'static SyscallContext {
        let stack = Stack::new(SYSCALL_STACK_SIZE);
        let ctx = Context::new(ContextKind::Syscall, stack.top());
        Box::leak(Box::new(SyscallContext {
            ctx,
            stack,
            op: Mutex::new(None),
        }))
    }

    pub fn get(ci: &CpuInfo) -> &'static SyscallContext {
        match irq_guarded(|| ci.free_syscall_contexts.lock().pop()) {
            Some(sc) => {
                unsafe { sc.ctx.frame() }.reset_stack();
                sc.ctx.reset_refs();
                sc
            }
            None => Self::allocate(),
        }
    }

    pub fn stack_top(&self) -> u64 {
        self.stack.top()
    }
}

impl ContextVariant for SyscallContext {
    fn context(&self) -> &Context {
        &self.ctx
    }

    fn on_recycle(&'static self) {
        let ci = cpu::current_cpu();
        irq_guarded(|| ci.free_syscall_contexts.lock().push(self));
    }
}

/// Give a CPU its designated kernel context and install it as current.
/// Runs on the target CPU during bring-up.
pub fn init_cpu_contexts(ci: &'static CpuInfo) {
    let kc = KernelContext::allocate();
    ci.set_kernel_context(kc);
    context_resume(kc);
    ci.state.store(CpuState::Kernel, Ordering::Relaxed);
}
