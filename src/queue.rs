//! Per-worker priority queue.
//!
//! Items are ordered by:
//! 1. Priority (numerically highest first)
//! 2. `enqueued_at` (earliest first)
//! 3. Insertion sequence (FIFO among identical timestamps)
//!
//! Identity keys are tracked alongside the ordered map so duplicates are
//! rejected and removal by key does not scan the queue.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::QueueError;
use crate::{IdentityKey, QueueItem};

/// Queue shared between its owning worker and the dispatcher.
pub type SharedQueue = Arc<Mutex<WorkQueue>>;

type OrderKey = (Reverse<u32>, DateTime<Utc>, u64);

#[derive(Debug, Default)]
pub struct WorkQueue {
    ordered: BTreeMap<OrderKey, QueueItem>,
    keys: HashMap<IdentityKey, OrderKey>,
    next_sequence: u64,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a queue from persisted items, keeping their relative order.
    /// Duplicate keys in the input are skipped.
    pub fn from_items(items: impl IntoIterator<Item = QueueItem>) -> Self {
        let mut queue = WorkQueue::new();
        for item in items {
            if let Err(err) = queue.try_enqueue(item) {
                warn!(error = %err, "Skipping item while restoring queue");
            }
        }
        queue
    }

    pub fn shared(self) -> SharedQueue {
        Arc::new(Mutex::new(self))
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn try_enqueue(&mut self, item: QueueItem) -> Result<(), QueueError> {
        let key = item.identity();
        if self.keys.contains_key(&key) {
            return Err(QueueError::Duplicate(key));
        }

        let order = (Reverse(item.priority), item.enqueued_at, self.next_sequence);
        self.next_sequence += 1;

        self.keys.insert(key, order);
        self.ordered.insert(order, item);
        Ok(())
    }

    /// The item the worker should process next, or `None` when empty.
    pub fn peek_highest(&self) -> Option<&QueueItem> {
        self.ordered.values().next()
    }

    /// Removes the item with this key. Absent keys are ignored since the
    /// dispatcher may have removed the item already.
    pub fn remove(&mut self, key: &IdentityKey) -> Option<QueueItem> {
        let order = self.keys.remove(key)?;
        self.ordered.remove(&order)
    }

    pub fn remove_all_for_user(&mut self, username: &str) -> usize {
        let doomed: Vec<IdentityKey> = self
            .ordered
            .values()
            .filter(|item| item.matches_user(username))
            .map(QueueItem::identity)
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    /// Items in extraction order.
    pub fn items(&self) -> impl Iterator<Item = &QueueItem> {
        self.ordered.values()
    }

    pub fn to_vec(&self) -> Vec<QueueItem> {
        self.items().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::item;
    use proptest::prelude::*;

    fn drain(queue: &mut WorkQueue) -> Vec<String> {
        let mut out = vec![];
        while let Some(next) = queue.peek_highest().map(QueueItem::identity) {
            out.push(next.media_id.clone());
            queue.remove(&next);
        }
        out
    }

    #[test]
    fn highest_priority_first_then_fifo() {
        let mut queue = WorkQueue::new();
        queue.try_enqueue(item("A", "u", 0, 0)).unwrap();
        queue.try_enqueue(item("B", "u", 0, 0)).unwrap();
        queue.try_enqueue(item("C", "u", 2, 0)).unwrap();

        assert_eq!(drain(&mut queue), vec!["C", "A", "B"]);
    }

    #[test]
    fn earlier_timestamp_wins_within_priority() {
        let mut queue = WorkQueue::new();
        queue.try_enqueue(item("late", "u", 1, 50)).unwrap();
        queue.try_enqueue(item("early", "u", 1, 10)).unwrap();

        assert_eq!(queue.peek_highest().unwrap().media_id, "early");
    }

    #[test]
    fn empty_queue_peeks_none() {
        let queue = WorkQueue::new();
        assert!(queue.peek_highest().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_identity_rejected() {
        let mut queue = WorkQueue::new();
        queue.try_enqueue(item("m", "alice", 0, 0)).unwrap();

        let err = queue.try_enqueue(item("m", "alice", 3, 5)).unwrap_err();
        assert_eq!(err, QueueError::Duplicate(IdentityKey::new("m", "alice")));

        // Same media for another user is separate work.
        queue.try_enqueue(item("m", "bob", 0, 0)).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut queue = WorkQueue::new();
        queue.try_enqueue(item("m", "alice", 0, 0)).unwrap();

        assert!(queue.remove(&IdentityKey::new("x", "alice")).is_none());
        assert!(queue.remove(&IdentityKey::new("m", "alice")).is_some());
        assert!(queue.remove(&IdentityKey::new("m", "alice")).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_all_for_user_matches_target_and_origin() {
        let mut queue = WorkQueue::new();
        queue.try_enqueue(item("1", "alice", 0, 0)).unwrap();
        queue.try_enqueue(item("2", "bob", 0, 0)).unwrap();
        let mut posted_by_alice = item("3", "carol", 0, 0);
        posted_by_alice.origin_username = "alice".into();
        queue.try_enqueue(posted_by_alice).unwrap();

        assert_eq!(queue.remove_all_for_user("alice"), 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&IdentityKey::new("2", "bob")));
        assert_eq!(queue.remove_all_for_user("nobody"), 0);
    }

    #[test]
    fn from_items_preserves_order_and_skips_duplicates() {
        let items = vec![
            item("b", "u", 0, 0),
            item("a", "u", 0, 0),
            item("a", "u", 0, 0),
            item("c", "u", 5, 0),
        ];
        let queue = WorkQueue::from_items(items);
        let order: Vec<_> = queue.items().map(|i| i.media_id.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    proptest! {
        #[test]
        fn extraction_order_is_priority_then_arrival(
            entries in prop::collection::vec((0u32..4, 0i64..5), 0..40)
        ) {
            let mut queue = WorkQueue::new();
            for (idx, (priority, at)) in entries.iter().enumerate() {
                queue.try_enqueue(item(&idx.to_string(), "u", *priority, *at)).unwrap();
            }

            let mut expected: Vec<(usize, u32, i64)> = entries
                .iter()
                .enumerate()
                .map(|(idx, (p, at))| (idx, *p, *at))
                .collect();
            expected.sort_by_key(|(idx, p, at)| (Reverse(*p), *at, *idx));
            let expected: Vec<String> = expected.iter().map(|(idx, _, _)| idx.to_string()).collect();

            prop_assert_eq!(drain(&mut queue), expected);
        }
    }
}
