use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Bounded multi-producer multi-consumer queue of job items.
///
/// Capacity 0 marks a stage that never queues: publishing always hands the
/// item back so the producer runs it inline.
pub struct JobQueue<T> {
    name: &'static str,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_full: Condvar,
}

impl<T> JobQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            not_full: Condvar::new(),
        }
    }

    /// Queue name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this stage runs inline on the producer.
    pub fn is_inline(&self) -> bool {
        self.capacity == 0
    }

    /// Publishes without waiting; hands the item back when the queue is full.
    pub fn try_publish(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    /// Publishes, waiting up to `wait` for a free slot.
    pub fn publish_timeout(&self, item: T, wait: Duration) -> Result<(), T> {
        if self.capacity == 0 {
            return Err(item);
        }
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            let _ = self.not_full.wait_for(&mut items, wait);
            if items.len() >= self.capacity {
                return Err(item);
            }
        }
        items.push_back(item);
        Ok(())
    }

    /// Claims the oldest item. Each item is handed to exactly one caller.
    pub fn try_claim(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether no item is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
