use crate::{TestResult, wait_until};
use alloc::format;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use uno_kernel::cpu;
use uno_kernel::sched::context::{ContextVariant, context_acquire, context_release};
use uno_kernel::sched::kcontext::KernelContext;
use uno_kernel::sched::thread;
use uno_kernel::time::seconds;
use x86_64::instructions::interrupts;

struct RacedCell(UnsafeCell<u64>);
// Guarded by context ownership in the test below, nothing else.
unsafe impl Sync for RacedCell {}

static SHARED: RacedCell = RacedCell(UnsafeCell::new(0));
static CONTENDERS_DONE: AtomicU64 = AtomicU64::new(0);

const CONTEND_ITERS: u64 = 10_000;

/// Two threads hammer `context_acquire` on one context and mutate a
/// plain cell under it. Ownership is the only protection; the final
/// count is exact iff acquisition is exclusive.
pub fn acquire_excludes_concurrent_owners() -> TestResult {
    let kc = KernelContext::allocate();
    for _ in 0..2 {
        thread::spawn("ctx-contender", move || {
            for _ in 0..CONTEND_ITERS {
                // interrupts off so this CPU cannot be preempted while
                // owning the context
                interrupts::without_interrupts(|| {
                    let ci = cpu::current_cpu();
                    context_acquire(kc.context(), ci.id);
                    unsafe {
                        let p = SHARED.0.get();
                        let v = *p;
                        core::hint::spin_loop();
                        *p = v + 1;
                    }
                    context_release(kc.context());
                });
            }
            CONTENDERS_DONE.fetch_add(1, Ordering::SeqCst);
        });
    }
    if !wait_until(seconds(10), || CONTENDERS_DONE.load(Ordering::SeqCst) == 2) {
        return TestResult::Failed("contender threads did not finish".into());
    }
    let total = unsafe { *SHARED.0.get() };
    if total != 2 * CONTEND_ITERS {
        return TestResult::Failed(format!(
            "lost updates under contention: {total} != {}",
            2 * CONTEND_ITERS
        ));
    }
    TestResult::Ok
}

pub fn kernel_context_pool_recycles() -> TestResult {
    interrupts::without_interrupts(|| {
        let ci = cpu::current_cpu();
        let a = KernelContext::get(ci);
        let pa = a as *const KernelContext;
        a.release();
        let b = KernelContext::get(ci);
        let pb = b as *const KernelContext;
        b.release();
        if pa == pb {
            TestResult::Ok
        } else {
            TestResult::Failed("released context was not recycled from the free list".into())
        }
    })
}

pub fn spawned_threads_all_run() -> TestResult {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    for _ in 0..8 {
        thread::spawn("worker", || {
            COUNTER.fetch_add(1, Ordering::SeqCst);
        });
    }
    if wait_until(seconds(5), || COUNTER.load(Ordering::SeqCst) >= 8) {
        TestResult::Ok
    } else {
        TestResult::Failed(format!(
            "only {} of 8 threads ran",
            COUNTER.load(Ordering::SeqCst)
        ))
    }
}
