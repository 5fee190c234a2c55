//! In-memory external-identifier cache.
//!
//! Maps a document-local identifier (or a content digest) to the cache
//! entry holding its surrogate id. Lookups are lock-free; registration is
//! only valid inside the keyed critical section for that key, and a
//! duplicate registration means the locking discipline was bypassed.

use crate::model::{CacheEntry, CacheScope};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

pub struct IdCache {
    entries: DashMap<String, CacheEntry>,
    capacity: usize,
    capacity_warned: AtomicBool,
}

impl IdCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            capacity_warned: AtomicBool::new(false),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert a new entry. Panics if the key already has one: surrogate-id
    /// assignment is at-most-once per key, and callers must hold the key's
    /// lock across the lookup-then-register sequence.
    pub fn register(&self, key: &str, entry: CacheEntry) {
        if self.entries.len() >= self.capacity {
            self.evict();
        }
        let previous = self.entries.insert(key.to_string(), entry);
        assert!(
            previous.is_none(),
            "duplicate registration for external key {key:?}"
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop just enough global-scope entries to make room for one more:
    /// they can always be re-resolved through the persistent fallback, so
    /// the rest stay warm. Session entries hold the only copy of their
    /// surrogate id and are never evicted.
    fn evict(&self) {
        let mut needed = self.entries.len() + 1 - self.capacity;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if needed > 0 && entry.scope == CacheScope::Global {
                needed -= 1;
                false
            } else {
                true
            }
        });
        let evicted = before - self.entries.len();
        if evicted == 0 && !self.capacity_warned.swap(true, Ordering::Relaxed) {
            warn!(
                capacity = self.capacity,
                "id cache over capacity with no evictable entries"
            );
        }
    }
}
