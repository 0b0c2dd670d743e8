//! The dirty/processing/queue triple.
//!
//! [`KeySet`] is the synchronization core of the work queue. It holds no lock
//! itself; [`crate::WorkQueue`] guards one instance with a single mutex
//! because the invariants below span all three collections:
//!
//! - every key in `queue` is in `dirty` and not in `processing`
//! - a key may be in `processing` and `dirty` at once (re-added while being
//!   handled); such a key is not in `queue` until it is completed
//! - a key absent from all three has no pending work
//! - no key appears in `queue` more than once

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Deduplicating key bookkeeping for a work queue.
#[derive(Debug)]
pub struct KeySet<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
}

impl<K> Default for KeySet<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> KeySet<K> {
    /// Create an empty key set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` as needing work.
    ///
    /// Returns `true` when the key was appended to the queue and a waiting
    /// consumer should be woken. A key that is already dirty is left alone;
    /// a key that is being processed is only marked dirty and gets queued
    /// again by [`KeySet::complete`].
    pub fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Hand out the oldest queued key, moving it from `dirty` to `processing`.
    pub fn pop(&mut self) -> Option<K> {
        let key = self.queue.pop_front()?;
        self.dirty.remove(&key);
        self.processing.insert(key.clone());
        Some(key)
    }

    /// Finish processing `key`.
    ///
    /// Returns `true` when the key was re-dirtied while it was processed and
    /// has been appended to the queue again. Completing a key that is not
    /// being processed does nothing.
    pub fn complete(&mut self, key: &K) -> bool {
        if !self.processing.remove(key) {
            return false;
        }
        if self.dirty.contains(key) {
            self.queue.push_back(key.clone());
            return true;
        }
        false
    }

    /// Number of keys waiting to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of keys currently handed out.
    #[must_use]
    pub fn processing_len(&self) -> usize {
        self.processing.len()
    }

    #[must_use]
    pub fn is_dirty(&self, key: &K) -> bool {
        self.dirty.contains(key)
    }

    #[must_use]
    pub fn is_processing(&self, key: &K) -> bool {
        self.processing.contains(key)
    }

    #[cfg(test)]
    fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for key in &self.queue {
            if !seen.insert(key) {
                return Err("key queued twice".to_string());
            }
            if !self.dirty.contains(key) {
                return Err("queued key is not dirty".to_string());
            }
            if self.processing.contains(key) {
                return Err("queued key is also processing".to_string());
            }
        }
        let parked = self
            .dirty
            .iter()
            .filter(|k| !seen.contains(k) && !self.processing.contains(*k))
            .count();
        if parked > 0 {
            return Err(format!("{parked} dirty keys are neither queued nor processing"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_dedups_queued_key() {
        let mut keys = KeySet::new();
        assert!(keys.insert("a"));
        assert!(!keys.insert("a"));
        assert!(!keys.insert("a"));
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_pop_is_fifo_among_distinct_keys() {
        let mut keys = KeySet::new();
        keys.insert("a");
        keys.insert("b");
        keys.insert("c");
        assert_eq!(keys.pop(), Some("a"));
        assert_eq!(keys.pop(), Some("b"));
        assert_eq!(keys.pop(), Some("c"));
        assert_eq!(keys.pop(), None);
    }

    #[test]
    fn test_reinsert_during_processing_is_deferred() {
        let mut keys = KeySet::new();
        keys.insert("ns/x");
        assert_eq!(keys.pop(), Some("ns/x"));

        assert!(!keys.insert("ns/x"), "must not queue while processing");
        assert!(keys.is_dirty(&"ns/x"));
        assert!(keys.is_processing(&"ns/x"));
        assert_eq!(keys.pop(), None);

        assert!(keys.complete(&"ns/x"));
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.pop(), Some("ns/x"));
        assert_eq!(keys.pop(), None);
    }

    #[test]
    fn test_complete_without_redirty_settles_key() {
        let mut keys = KeySet::new();
        keys.insert("a");
        keys.pop();
        assert!(!keys.complete(&"a"));
        assert!(!keys.is_dirty(&"a"));
        assert!(!keys.is_processing(&"a"));
        assert!(keys.is_empty());
    }

    #[test]
    fn test_complete_of_unknown_key_is_ignored() {
        let mut keys = KeySet::new();
        keys.insert("a");
        assert!(!keys.complete(&"a"), "queued but not processing");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.check_invariants(), Ok(()));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8),
        Pop,
        Complete(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Insert),
            Just(Op::Pop),
            (0u8..6).prop_map(Op::Complete),
        ]
    }

    proptest! {
        #[test]
        fn invariants_hold_for_any_operation_sequence(ops in proptest::collection::vec(op(), 0..200)) {
            let mut keys = KeySet::new();
            let mut in_flight = HashSet::new();
            for op in ops {
                match op {
                    Op::Insert(k) => {
                        keys.insert(k);
                    }
                    Op::Pop => {
                        if let Some(k) = keys.pop() {
                            prop_assert!(in_flight.insert(k), "key {} handed out twice", k);
                        }
                    }
                    Op::Complete(k) => {
                        keys.complete(&k);
                        in_flight.remove(&k);
                    }
                }
                prop_assert_eq!(keys.check_invariants(), Ok(()));
            }
        }
    }
}
