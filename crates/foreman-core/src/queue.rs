//! In-memory priority-ordered view of `PENDING` tasks.
//!
//! The queue is a volatile derived view of the store: entries carry only a
//! task id plus snapshots of the ordering fields, and the whole thing is
//! rebuilt from `list_pending()` on startup. Producers are the
//! per-connection handlers; the single consumer is the dispatcher.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use foreman_db::models::Task;

/// A queued reference to a task in the store.
///
/// Ordering: higher priority first, then earlier `created_at`, then id byte
/// order so equal-millisecond submissions still dispatch deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: Uuid,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for QueueEntry {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            priority: task.priority,
            created_at: task.created_at,
        }
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops its greatest element, so "greater" means
        // "dispatches first".
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.id.as_bytes().cmp(self.id.as_bytes()))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Thread-safe ready queue: many producers, one consumer.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task reference, waking the consumer if it is parked.
    pub fn enqueue(&self, task: &Task) {
        self.enqueue_entry(QueueEntry::from(task));
    }

    /// Insert an already-built entry (used when re-enqueueing after a
    /// failed dispatch, where the snapshot is still at hand).
    pub fn enqueue_entry(&self, entry: QueueEntry) {
        self.heap
            .lock()
            .expect("ready queue mutex poisoned")
            .push(entry);
        self.notify.notify_one();
    }

    /// Remove and return the highest-priority entry, suspending until one
    /// is available.
    pub async fn pop(&self) -> QueueEntry {
        loop {
            if let Some(entry) = self.try_pop() {
                return entry;
            }
            // A permit stored by a concurrent enqueue is consumed here, so
            // the enqueue-between-try_pop-and-await race cannot lose a
            // wakeup.
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<QueueEntry> {
        self.heap
            .lock()
            .expect("ready queue mutex poisoned")
            .pop()
    }

    /// Advisory snapshot; callers must tolerate a racing consumer.
    pub fn non_empty(&self) -> bool {
        !self
            .heap
            .lock()
            .expect("ready queue mutex poisoned")
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("ready queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        !self.non_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    fn entry(priority: i32, created_ms: i64, id: Uuid) -> QueueEntry {
        QueueEntry {
            id,
            priority,
            created_at: Utc.timestamp_millis_opt(created_ms).unwrap(),
        }
    }

    #[test]
    fn pops_highest_priority_first() {
        let queue = ReadyQueue::new();
        let low = entry(1, 0, Uuid::new_v4());
        let high = entry(9, 0, Uuid::new_v4());
        let mid = entry(5, 0, Uuid::new_v4());
        queue.enqueue_entry(low.clone());
        queue.enqueue_entry(high.clone());
        queue.enqueue_entry(mid.clone());

        assert_eq!(queue.try_pop().unwrap().id, high.id);
        assert_eq!(queue.try_pop().unwrap().id, mid.id);
        assert_eq!(queue.try_pop().unwrap().id, low.id);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn equal_priority_breaks_on_age() {
        let queue = ReadyQueue::new();
        let older = entry(5, 100, Uuid::new_v4());
        let newer = entry(5, 200, Uuid::new_v4());
        queue.enqueue_entry(newer.clone());
        queue.enqueue_entry(older.clone());

        assert_eq!(queue.try_pop().unwrap().id, older.id);
        assert_eq!(queue.try_pop().unwrap().id, newer.id);
    }

    #[test]
    fn same_millisecond_breaks_on_id_bytes() {
        let queue = ReadyQueue::new();
        let a = entry(5, 100, Uuid::from_u128(1));
        let b = entry(5, 100, Uuid::from_u128(2));
        queue.enqueue_entry(b.clone());
        queue.enqueue_entry(a.clone());

        assert_eq!(queue.try_pop().unwrap().id, a.id);
        assert_eq!(queue.try_pop().unwrap().id, b.id);
    }

    #[test]
    fn non_empty_tracks_contents() {
        let queue = ReadyQueue::new();
        assert!(!queue.non_empty());
        assert_eq!(queue.len(), 0);

        queue.enqueue_entry(entry(1, 0, Uuid::new_v4()));
        assert!(queue.non_empty());
        assert_eq!(queue.len(), 1);

        queue.try_pop();
        assert!(!queue.non_empty());
    }

    #[tokio::test]
    async fn pop_suspends_until_enqueue() {
        let queue = Arc::new(ReadyQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        // Give the consumer a chance to park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        let expected = Uuid::new_v4();
        queue.enqueue_entry(entry(3, 0, expected));

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pop should wake")
            .expect("consumer should not panic");
        assert_eq!(popped.id, expected);
    }

    #[tokio::test]
    async fn enqueue_before_pop_is_not_lost() {
        let queue = ReadyQueue::new();
        let expected = Uuid::new_v4();
        queue.enqueue_entry(entry(1, 0, expected));

        let popped = tokio::time::timeout(Duration::from_secs(1), queue.pop())
            .await
            .expect("pop should return immediately");
        assert_eq!(popped.id, expected);
    }
}
