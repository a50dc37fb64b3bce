//! Expiry scheduling for pending holds.
//!
//! A min-heap ordered by `expires_at`, with lazy removal: removing a key only
//! drops it from the side map, and stale heap entries are discarded when
//! they reach the top.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExpiryEntry<K> {
    expires_at_ms: u64,
    key: K,
}

impl<K: Ord> Ord for ExpiryEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: earliest expiry at the top of the max-heap.
        other
            .expires_at_ms
            .cmp(&self.expires_at_ms)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl<K: Ord> PartialOrd for ExpiryEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of keys by expiry time.
#[derive(Debug)]
pub struct ExpirationQueue<K> {
    heap: BinaryHeap<ExpiryEntry<K>>,
    live: HashMap<K, u64>,
}

impl<K> ExpirationQueue<K>
where
    K: Ord + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    /// Schedule `key`, replacing any earlier schedule for it.
    pub fn schedule(&mut self, key: K, expires_at_ms: u64) {
        self.live.insert(key.clone(), expires_at_ms);
        self.heap.push(ExpiryEntry { expires_at_ms, key });
    }

    /// Unschedule `key`; returns whether it was scheduled.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.live.remove(key).is_some()
    }

    /// Pop every key due at or before `now_ms`, earliest first.
    pub fn drain_due(&mut self, now_ms: u64) -> Vec<K> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if self.live.get(&top.key) != Some(&top.expires_at_ms) {
                self.heap.pop();
                continue;
            }
            if top.expires_at_ms > now_ms {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                self.live.remove(&entry.key);
                due.push(entry.key);
            }
        }
        due
    }

    pub fn next_due(&self) -> Option<u64> {
        self.live.values().min().copied()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl<K> Default for ExpirationQueue<K>
where
    K: Ord + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_expiry_order() {
        let mut q = ExpirationQueue::new();
        q.schedule("b", 20);
        q.schedule("a", 10);
        q.schedule("c", 30);
        assert_eq!(q.drain_due(25), vec!["a", "b"]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_due(), Some(30));
    }

    #[test]
    fn cancelled_and_rescheduled_entries_are_skipped() {
        let mut q = ExpirationQueue::new();
        q.schedule("a", 10);
        q.schedule("b", 10);
        assert!(q.cancel(&"a"));
        assert!(!q.cancel(&"a"));
        q.schedule("b", 50);
        assert!(q.drain_due(20).is_empty());
        assert_eq!(q.drain_due(50), vec!["b"]);
        assert!(q.is_empty());
    }
}
