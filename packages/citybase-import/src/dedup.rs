//! Content-addressable deduplication caches.
//!
//! Shared textures and relative geometries can be referenced by many
//! features; recognizing them by content digest instead of document
//! position keeps one stored row per resource. Lookup order is in-memory,
//! then the persistent fallback, then insert: cheapest check first,
//! correct across runs.

use crate::error::Result;
use crate::id_cache::IdCache;
use crate::model::{CacheEntry, DedupKind};
use crate::ports::GlobalLookup;
use tracing::debug;

pub struct DedupCache {
    kind: DedupKind,
    entries: IdCache,
}

impl DedupCache {
    pub fn new(kind: DedupKind, capacity: usize) -> Self {
        Self {
            kind,
            entries: IdCache::with_capacity(capacity),
        }
    }

    pub fn kind(&self) -> DedupKind {
        self.kind
    }

    pub fn lookup(&self, digest_hex: &str) -> Option<CacheEntry> {
        self.entries.lookup(digest_hex)
    }

    pub fn register(&self, digest_hex: &str, entry: CacheEntry) {
        self.entries.register(digest_hex, entry);
    }

    /// In-memory lookup, falling back to the destination store: a row with
    /// this digest may already exist from an earlier run or an earlier
    /// flushed batch. A fallback hit is cached at global scope so later
    /// callers reuse the surrogate id without re-inserting.
    pub fn lookup_with_fallback(
        &self,
        digest_hex: &str,
        global: Option<&dyn GlobalLookup>,
    ) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.lookup(digest_hex) {
            return Ok(Some(entry));
        }
        let Some(global) = global else {
            return Ok(None);
        };
        match global.find_digest(self.kind, digest_hex)? {
            Some(id) => {
                // Dedup rows carry no feature type tag.
                let entry = CacheEntry::global(id, 0);
                self.entries.register(digest_hex, entry.clone());
                debug!(
                    kind = self.kind.as_str(),
                    digest = digest_hex,
                    id,
                    "dedup fallback hit"
                );
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
