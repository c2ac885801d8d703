use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Fixed set of numbered sandbox slots shared by every run on this host
///
/// A slot number doubles as the `isolate` box id, so two executions never
/// share a box.
pub struct SlotPool {
    free: Mutex<VecDeque<usize>>,
    notify: Notify,
    capacity: usize,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..capacity).collect()),
            notify: Notify::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Waits until a slot is free and takes it
    pub async fn acquire(self: &Arc<Self>) -> SlotGuard {
        loop {
            if let Some(slot) = self.free.lock().pop_front() {
                return SlotGuard {
                    pool: Arc::clone(self),
                    slot,
                };
            }
            self.notify.notified().await;
        }
    }

    fn release(&self, slot: usize) {
        self.free.lock().push_back(slot);
        self.notify.notify_one();
    }
}

/// A held slot, returned to the pool on drop
pub struct SlotGuard {
    pool: Arc<SlotPool>,
    slot: usize,
}

impl SlotGuard {
    pub fn id(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}
