use crate::lock::irq_guarded;
use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Epoll: u32 {
        const EPOLLIN = 0x1;
        const EPOLLOUT = 0x4;
        const EPOLLERR = 0x8;
        const EPOLLHUP = 0x10;
    }
}

/// Called with the delivered event set; returns false to deregister.
pub type EventHandler = Box<dyn FnMut(Epoll) -> bool + Send>;

struct NotifyEntry {
    mask: Epoll,
    handler: EventHandler,
}

/// Edge-triggered event fan-out for one file endpoint. A dispatch with an
/// empty set is the "armed again" edge: delivered to every entry so
/// level-tracking consumers can reset.
pub struct NotifySet {
    entries: Mutex<Vec<NotifyEntry>>,
}

impl NotifySet {
    pub const fn new() -> NotifySet {
        NotifySet {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, mask: Epoll, handler: EventHandler) {
        irq_guarded(|| {
            self.entries.lock().push(NotifyEntry { mask, handler });
        });
    }

    /// HUP and ERR are always delivered regardless of the registered
    /// mask, matching epoll semantics.
    pub fn dispatch(&self, events: Epoll) {
        irq_guarded(|| {
            let mut entries = self.entries.lock();
            entries.retain_mut(|e| {
                let delivered = events & (e.mask | Epoll::EPOLLHUP | Epoll::EPOLLERR);
                if events.is_empty() || !delivered.is_empty() {
                    (e.handler)(delivered)
                } else {
                    true
                }
            });
        });
    }

    pub fn clear(&self) {
        irq_guarded(|| self.entries.lock().clear());
    }

    pub fn len(&self) -> usize {
        irq_guarded(|| self.entries.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NotifySet {
    fn default() -> Self {
        NotifySet::new()
    }
}
