//! Request deduplication for chatsync.
//!
//! Tracks the resource ids that have a remote request outstanding, so the
//! same resource is not fetched twice concurrently. Ids are added when a
//! request is issued and removed explicitly by the call site once it
//! completes; nothing expires on its own.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

/// Thread-safe set of resource ids with a request in flight.
#[derive(Debug)]
pub struct RequestDeduplicationTracker<K> {
    executing: Mutex<HashSet<K>>,
}

impl<K: Eq + Hash + Clone> RequestDeduplicationTracker<K> {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            executing: Mutex::new(HashSet::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<K>> {
        // The set stays consistent even if a holder panicked
        self.executing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark ids as executing. Idempotent.
    pub fn add<I: IntoIterator<Item = K>>(&self, ids: I) {
        self.lock().extend(ids);
    }

    /// Mark ids as no longer executing. Unknown ids are ignored.
    pub fn remove<'a, I>(&self, ids: I)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut executing = self.lock();
        for id in ids {
            executing.remove(id);
        }
    }

    /// Whether a request for `id` is outstanding.
    pub fn is_executing(&self, id: &K) -> bool {
        self.lock().contains(id)
    }

    /// Whether a request for any of `ids` is outstanding.
    pub fn is_executing_any<'a, I>(&self, ids: I) -> bool
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let executing = self.lock();
        ids.into_iter().any(|id| executing.contains(id))
    }

    /// Atomically claim the ids that are not already executing.
    ///
    /// Returns the claimed ids, in input order. Ids already in flight
    /// are left to their current owner.
    pub fn claim<I: IntoIterator<Item = K>>(&self, ids: I) -> Vec<K> {
        let mut executing = self.lock();
        ids.into_iter()
            .filter(|id| executing.insert(id.clone()))
            .collect()
    }

    /// Number of ids in flight.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// No ids in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every id.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl<K: Eq + Hash + Clone> Default for RequestDeduplicationTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}
