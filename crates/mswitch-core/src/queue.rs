//! Command Queue (C2).
//!
//! A bounded FIFO of switch requests, built as a multi-producer /
//! single-consumer ring buffer: several independent tasks (the HTTP
//! receiver, the file-poll CLI, the failover engine) all enqueue, and one
//! task (the Selection Actuator) dequeues. The consumer side advances
//! `tail` lock-free; the producer side trades a lock-free `head` advance
//! for a `Mutex<usize>` guarding the index bump and the slot write
//! together, which is the minimum needed to make concurrent producers
//! safe without serializing the consumer behind the same lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::ControllerError;

/// One queued switch request.
#[derive(Debug, Clone)]
pub struct CommandEntry {
    pub source_id: String,
    pub enqueued_at_us: u64,
}

#[derive(Default)]
struct Slot {
    entry: Option<CommandEntry>,
}

struct QueueInner {
    head: Mutex<usize>,
    tail: AtomicUsize,
    slots: Box<[UnsafeCell<Slot>]>,
    /// Logical capacity `Q` as configured (what fullness is judged
    /// against). `slots.len()` is this value rounded up to a power of two
    /// purely so slot indexing can mask instead of modulo.
    capacity: usize,
}

// SAFETY: producer access to a slot is serialized by `head`'s mutex;
// the consumer only ever touches the slot at `tail`, which no producer
// can be writing to (head always trails tail by at most `capacity`).
unsafe impl Send for QueueInner {}
unsafe impl Sync for QueueInner {}

/// Thread-safe, ordered FIFO of capacity `Q` (rounded up internally to the
/// next power of two so slot lookup can mask instead of modulo).
pub struct CommandQueue {
    inner: Arc<QueueInner>,
    notify: Arc<Notify>,
}

impl Clone for CommandQueue {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slot_count = capacity.next_power_of_two();
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            slots.push(UnsafeCell::new(Slot::default()));
        }

        Self {
            inner: Arc::new(QueueInner {
                head: Mutex::new(0),
                tail: AtomicUsize::new(0),
                slots: slots.into_boxed_slice(),
                capacity,
            }),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a switch request. Fails with `QueueFull` when
    /// `(tail + 1) mod Q == head` (the rounded-up slot array only widens
    /// the index space; fullness is judged against the logical capacity,
    /// not the padded slot count).
    pub fn enqueue(&self, entry: CommandEntry) -> Result<(), ControllerError> {
        let mut head = self.inner.head.lock().expect("command queue head mutex poisoned");
        let tail = self.inner.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= self.inner.capacity {
            return Err(ControllerError::QueueFull);
        }

        let idx = *head & (self.inner.slots.len() - 1);
        // SAFETY: only one producer can hold `head`'s lock at a time, and
        // the consumer cannot be reading this slot (it trails `*head`).
        unsafe {
            let slot = &mut *self.inner.slots[idx].get();
            slot.entry = Some(entry);
        }
        *head = head.wrapping_add(1);
        drop(head);

        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the oldest entry, if any. Only the actuator calls this.
    pub fn try_dequeue(&self) -> Option<CommandEntry> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = *self.inner.head.lock().expect("command queue head mutex poisoned");

        if tail == head {
            return None;
        }

        let idx = tail & (self.inner.slots.len() - 1);
        // SAFETY: single consumer; the slot at `tail` was fully written
        // before `head` passed it.
        let entry = unsafe {
            let slot = &mut *self.inner.slots[idx].get();
            slot.entry.take()
        };

        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        entry
    }

    /// Wait asynchronously for the next entry.
    pub async fn dequeue(&self) -> CommandEntry {
        loop {
            if let Some(entry) = self.try_dequeue() {
                return entry;
            }
            self.notify.notified().await;
        }
    }

    /// Discard all queued entries (shutdown).
    pub fn drain(&self) {
        while self.try_dequeue().is_some() {}
    }

    /// Number of entries currently queued.
    pub fn len(&self) -> usize {
        let head = *self.inner.head.lock().expect("command queue head mutex poisoned");
        let tail = self.inner.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> CommandEntry {
        CommandEntry {
            source_id: id.to_string(),
            enqueued_at_us: 0,
        }
    }

    #[test]
    fn fifo_order() {
        let q = CommandQueue::new(8);
        q.enqueue(entry("s0")).unwrap();
        q.enqueue(entry("s1")).unwrap();
        q.enqueue(entry("s2")).unwrap();

        assert_eq!(q.try_dequeue().unwrap().source_id, "s0");
        assert_eq!(q.try_dequeue().unwrap().source_id, "s1");
        assert_eq!(q.try_dequeue().unwrap().source_id, "s2");
        assert!(q.try_dequeue().is_none());
    }

    #[test]
    fn full_queue_rejects_and_reports() {
        // default capacity is 100; the slot array rounds up to 128 but
        // fullness is still judged at the logical capacity boundary.
        let q = CommandQueue::new(100);
        for i in 0..100 {
            q.enqueue(entry(&i.to_string())).unwrap();
        }
        match q.enqueue(entry("overflow")) {
            Err(ControllerError::QueueFull) => {}
            other => panic!("expected QueueFull, got {other:?}"),
        }
    }

    #[test]
    fn drain_empties_queue() {
        let q = CommandQueue::new(8);
        q.enqueue(entry("s0")).unwrap();
        q.enqueue(entry("s1")).unwrap();
        q.drain();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn async_dequeue_waits_for_entry() {
        let q = CommandQueue::new(8);
        let q2 = q.clone();

        let waiter = tokio::spawn(async move { q2.dequeue().await });
        tokio::task::yield_now().await;
        q.enqueue(entry("late")).unwrap();

        let got = waiter.await.unwrap();
        assert_eq!(got.source_id, "late");
    }
}
