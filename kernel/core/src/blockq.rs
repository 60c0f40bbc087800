use crate::cpu;
use crate::errno::Sysreturn;
use crate::lock::irq_guarded;
use crate::sched::context::ContextVariant;
use crate::sched::kcontext::KernelContext;
use crate::sched::runloop::async_apply_1;
use crate::time::ClockId;
use crate::time::timer::{TIMER_DISABLED, Timer, kernel_timers};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use bitflags::bitflags;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use spin::Mutex;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockqFlags: u32 {
        /// Re-invocation after a wake; the action had previously blocked.
        const BLOCKED = 1 << 0;
        /// The blockq is being flushed; the action must release its
        /// resources and complete with a cancellation error.
        const NULLIFY = 1 << 1;
        /// The action's timeout fired; it must complete now, typically
        /// with -ETIMEDOUT.
        const TIMEDOUT = 1 << 2;
    }
}

pub enum BlockOutcome {
    /// The action ran to completion and delivered its result through its
    /// completion; the value is returned to inline callers.
    Complete(Sysreturn),
    /// The condition is unsatisfied; park the action. Not permitted when
    /// NULLIFY or TIMEDOUT is set.
    Block,
}

/// A pending blocked operation. The action owns all state the operation
/// needs; it is re-invoked with flags until it completes, and it is on at
/// most one blockq at any time (ownership moves with it).
pub trait BlockqAction: Send {
    fn attempt(&mut self, flags: BlockqFlags) -> BlockOutcome;
}

/// Returned by [`Blockq::check`] when the action could not complete
/// inline: either it was parked (thread callers yield and receive the
/// real result through their completion), or the caller is on a
/// bottom-half stack and may not suspend at all. Internal-only; never
/// escapes to user-visible returns.
pub const BLOCKQ_BLOCK_REQUIRED: Sysreturn = i64::MIN;

struct Pending {
    id: u64,
    action: Box<dyn BlockqAction>,
    timeout: Option<Timer>,
}

/// Suspension primitive: associates pending actions with a wake
/// condition owned by the producer side.
pub struct Blockq {
    name: &'static str,
    waiters: Mutex<VecDeque<Pending>>,
    next_id: AtomicU64,
}

impl Blockq {
    pub const fn new(name: &'static str) -> Blockq {
        Blockq {
            name,
            waiters: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pending(&self) -> usize {
        irq_guarded(|| self.waiters.lock().len())
    }

    /// Invoke `action` once inline. A satisfied condition completes
    /// without suspension and the result is returned; otherwise the
    /// action is parked (bottom-half callers get the sentinel back
    /// immediately instead: they cannot suspend).
    pub fn check(&'static self, action: Box<dyn BlockqAction>) -> Sysreturn {
        self.check_timeout(action, None)
    }

    pub fn check_timeout(
        &'static self,
        mut action: Box<dyn BlockqAction>,
        timeout_ns: Option<u64>,
    ) -> Sysreturn {
        match action.attempt(BlockqFlags::empty()) {
            BlockOutcome::Complete(rv) => rv,
            BlockOutcome::Block => {
                let ci = cpu::current_cpu();
                if ci.in_bottom_half() {
                    return BLOCKQ_BLOCK_REQUIRED;
                }
                // Blocking on the designated kernel context abandons it;
                // give the CPU a fresh one first.
                let current = ci.current_context();
                if core::ptr::eq(current.context(), ci.kernel_context().context()) {
                    ci.set_kernel_context(KernelContext::get(ci));
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                irq_guarded(|| {
                    self.waiters.lock().push_back(Pending {
                        id,
                        action,
                        timeout: None,
                    })
                });
                // The action must be parked before the timer is armed, or
                // an immediate expiry could miss it and the timeout would
                // be lost.
                if let Some(ns) = timeout_ns {
                    let timer = kernel_timers().register(
                        ClockId::Monotonic,
                        ns,
                        false,
                        None,
                        Box::new(move |_expiry, overruns| {
                            if overruns == TIMER_DISABLED {
                                return;
                            }
                            self.expire(id);
                        }),
                    );
                    // If a wake already consumed the entry, the armed
                    // timer just no-ops in expire: ids are never reused.
                    irq_guarded(|| {
                        let mut waiters = self.waiters.lock();
                        if let Some(p) = waiters.iter_mut().find(|p| p.id == id) {
                            p.timeout = Some(timer);
                        }
                    });
                }
                BLOCKQ_BLOCK_REQUIRED
            }
        }
    }

    /// Re-invoke the head pending action from bottom-half context via the
    /// async-1 queue. An action that blocks again is re-parked; that is
    /// the expected shape of a spurious wake.
    pub fn wake_one(&'static self) -> bool {
        match irq_guarded(|| self.waiters.lock().pop_front()) {
            Some(p) => {
                self.schedule(p, BlockqFlags::BLOCKED);
                true
            }
            None => false,
        }
    }

    /// Cancel everything: every pending action is re-invoked with NULLIFY
    /// so it can unwind with -ERESTARTSYS or an analogous error.
    pub fn flush(&'static self) {
        while let Some(p) = irq_guarded(|| self.waiters.lock().pop_front()) {
            self.schedule(p, BlockqFlags::BLOCKED | BlockqFlags::NULLIFY);
        }
    }

    fn expire(&'static self, id: u64) {
        let p = irq_guarded(|| {
            let mut waiters = self.waiters.lock();
            let idx = waiters.iter().position(|p| p.id == id)?;
            waiters.remove(idx)
        });
        if let Some(p) = p {
            self.schedule(p, BlockqFlags::BLOCKED | BlockqFlags::TIMEDOUT);
        }
    }

    fn schedule(&'static self, mut p: Pending, flags: BlockqFlags) {
        let thunk = Box::new(move |arg: u64| {
            let flags = BlockqFlags::from_bits_truncate(arg as u32);
            match p.action.attempt(flags) {
                BlockOutcome::Complete(_) => {
                    if let Some(t) = p.timeout.take() {
                        t.cancel();
                    }
                }
                BlockOutcome::Block => {
                    assert!(
                        !flags.intersects(BlockqFlags::NULLIFY | BlockqFlags::TIMEDOUT),
                        "action blocked under {:?}",
                        flags
                    );
                    // the timeout, if any, stays armed across re-parks
                    irq_guarded(|| self.waiters.lock().push_back(p));
                }
            }
        });
        if let Err(a1) = async_apply_1(thunk, flags.bits() as u64) {
            // The async-1 queue is full. Dropping a wake or a
            // cancellation would strand the waiter forever, so run the
            // action on this stack instead.
            (a1.f)(a1.arg);
        }
    }
}
