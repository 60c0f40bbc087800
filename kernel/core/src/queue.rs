use crate::lock::irq_guarded;
use alloc::collections::VecDeque;
use spin::Mutex;

/// Bounded FIFO shared between producers and consumers. The capacity is a
/// hard cap: a full queue hands the element back to the caller instead of
/// growing, so hot paths never allocate.
///
/// The `_irqsafe` variants must be used on any queue touched from both
/// thread and interrupt context.
pub struct Queue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Queue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            return Err(value);
        }
        q.push_back(value);
        Ok(())
    }

    pub fn dequeue(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    pub fn enqueue_irqsafe(&self, value: T) -> Result<(), T> {
        irq_guarded(|| self.enqueue(value))
    }

    pub fn dequeue_irqsafe(&self) -> Option<T> {
        irq_guarded(|| self.dequeue())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
