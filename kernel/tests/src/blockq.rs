use crate::{TestResult, wait_until};
use alloc::boxed::Box;
use alloc::format;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use uno_kernel::blockq::{BLOCKQ_BLOCK_REQUIRED, BlockOutcome, Blockq, BlockqAction, BlockqFlags};
use uno_kernel::time::{milliseconds, seconds};

/// Records every attempt; blocks until `blocks_remaining` hits zero or a
/// cancellation/timeout arrives.
struct CountingAction {
    attempts: &'static AtomicU64,
    completions: &'static AtomicU64,
    blocks_remaining: &'static AtomicU64,
    last_flags: &'static AtomicU32,
}

impl BlockqAction for CountingAction {
    fn attempt(&mut self, flags: BlockqFlags) -> BlockOutcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.last_flags.store(flags.bits(), Ordering::SeqCst);
        if flags.intersects(BlockqFlags::NULLIFY | BlockqFlags::TIMEDOUT) {
            self.completions.fetch_add(1, Ordering::SeqCst);
            return BlockOutcome::Complete(-1);
        }
        if self
            .blocks_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return BlockOutcome::Block;
        }
        self.completions.fetch_add(1, Ordering::SeqCst);
        BlockOutcome::Complete(0)
    }
}

pub fn wake_reinvokes_and_reparks() -> TestResult {
    static BQ: Blockq = Blockq::new("test wake");
    static ATTEMPTS: AtomicU64 = AtomicU64::new(0);
    static COMPLETIONS: AtomicU64 = AtomicU64::new(0);
    static BLOCKS: AtomicU64 = AtomicU64::new(2);
    static FLAGS: AtomicU32 = AtomicU32::new(0);

    let rv = BQ.check(Box::new(CountingAction {
        attempts: &ATTEMPTS,
        completions: &COMPLETIONS,
        blocks_remaining: &BLOCKS,
        last_flags: &FLAGS,
    }));
    if rv != BLOCKQ_BLOCK_REQUIRED {
        return TestResult::Failed(format!("expected block-required sentinel, got {rv}"));
    }
    if BQ.pending() != 1 {
        return TestResult::Failed("action was not parked".into());
    }

    // First wake: the action blocks again and is re-parked.
    if !BQ.wake_one() {
        return TestResult::Failed("wake_one found no waiter".into());
    }
    if !wait_until(seconds(1), || ATTEMPTS.load(Ordering::SeqCst) == 2) {
        return TestResult::Failed("woken action was not re-invoked".into());
    }
    if COMPLETIONS.load(Ordering::SeqCst) != 0 || BQ.pending() != 1 {
        return TestResult::Failed("re-blocking action was not re-parked".into());
    }
    if FLAGS.load(Ordering::SeqCst) & BlockqFlags::BLOCKED.bits() == 0 {
        return TestResult::Failed("wake re-invocation missing BLOCKED flag".into());
    }

    // Second wake completes it.
    BQ.wake_one();
    if !wait_until(seconds(1), || COMPLETIONS.load(Ordering::SeqCst) == 1) {
        return TestResult::Failed("action never completed".into());
    }
    if BQ.pending() != 0 {
        return TestResult::Failed("completed action still pending".into());
    }
    TestResult::Ok
}

pub fn flush_nullifies_all_waiters() -> TestResult {
    static BQ: Blockq = Blockq::new("test flush");
    static ATTEMPTS: AtomicU64 = AtomicU64::new(0);
    static COMPLETIONS: AtomicU64 = AtomicU64::new(0);
    static BLOCKS: AtomicU64 = AtomicU64::new(u64::MAX);
    static FLAGS_A: AtomicU32 = AtomicU32::new(0);
    static FLAGS_B: AtomicU32 = AtomicU32::new(0);

    for flags in [&FLAGS_A, &FLAGS_B] {
        BQ.check(Box::new(CountingAction {
            attempts: &ATTEMPTS,
            completions: &COMPLETIONS,
            blocks_remaining: &BLOCKS,
            last_flags: flags,
        }));
    }
    if BQ.pending() != 2 {
        return TestResult::Failed("expected two parked actions".into());
    }
    BQ.flush();
    if !wait_until(seconds(1), || COMPLETIONS.load(Ordering::SeqCst) == 2) {
        return TestResult::Failed("flush did not complete all waiters".into());
    }
    if BQ.pending() != 0 {
        return TestResult::Failed("pending set not empty after flush".into());
    }
    for flags in [&FLAGS_A, &FLAGS_B] {
        if flags.load(Ordering::SeqCst) & BlockqFlags::NULLIFY.bits() == 0 {
            return TestResult::Failed("flushed action missing NULLIFY flag".into());
        }
    }
    TestResult::Ok
}

pub fn timeout_delivers_timedout() -> TestResult {
    static BQ: Blockq = Blockq::new("test timeout");
    static ATTEMPTS: AtomicU64 = AtomicU64::new(0);
    static COMPLETIONS: AtomicU64 = AtomicU64::new(0);
    static BLOCKS: AtomicU64 = AtomicU64::new(u64::MAX);
    static FLAGS: AtomicU32 = AtomicU32::new(0);

    BQ.check_timeout(
        Box::new(CountingAction {
            attempts: &ATTEMPTS,
            completions: &COMPLETIONS,
            blocks_remaining: &BLOCKS,
            last_flags: &FLAGS,
        }),
        Some(milliseconds(5)),
    );
    if BQ.pending() != 1 {
        return TestResult::Failed("action was not parked".into());
    }
    if !wait_until(seconds(2), || COMPLETIONS.load(Ordering::SeqCst) == 1) {
        return TestResult::Failed("timeout never completed the action".into());
    }
    if FLAGS.load(Ordering::SeqCst) & BlockqFlags::TIMEDOUT.bits() == 0 {
        return TestResult::Failed("timed-out action missing TIMEDOUT flag".into());
    }
    if BQ.pending() != 0 {
        return TestResult::Failed("pending set not empty after timeout".into());
    }
    TestResult::Ok
}
