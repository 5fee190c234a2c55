//! Import run coordinator.
//!
//! One coordinator per document stream. It owns the shared state of the
//! run: the identifier caches, the dedup caches, the deferred-reference
//! queue, and the batch writer, and serializes per-key decisions through
//! the keyed lock registry so importers running on worker threads never
//! double-assign a surrogate id.
//!
//! Lifecycle is linear: `Init -> Streaming -> Draining -> Closed`. Calls
//! outside the expected state fail with `InvalidStateTransition` instead
//! of corrupting the run.

use crate::batch::BatchWriter;
use crate::config::ImportConfig;
use crate::dedup::DedupCache;
use crate::deferred::DeferredQueue;
use crate::error::{ImportError, Result};
use crate::id_cache::IdCache;
use crate::keyed_lock::KeyedLockRegistry;
use crate::model::{
    BatchedRow, CacheEntry, CachePool, DedupKind, DeferredReference, Digest, Registration,
    TableSpec, UnresolvedReference,
};
use crate::ports::{GlobalLookup, IdSequence, ImporterRegistry, StatementExecutor};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Streaming,
    Draining,
    Closed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::Streaming => "streaming",
            RunState::Draining => "draining",
            RunState::Closed => "closed",
        }
    }
}

/// Outcome of the final resolution pass.
#[derive(Debug)]
pub struct DrainReport {
    pub resolved: usize,
    pub unresolved: Vec<UnresolvedReference>,
}

/// Run counters, returned by `close` and available any time via `summary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub features_registered: usize,
    pub rows_flushed: usize,
    pub patches_flushed: usize,
    pub references_enqueued: usize,
    pub references_resolved: usize,
    pub references_unresolved: usize,
    pub dedup_hits: usize,
}

pub struct ImportCoordinator {
    state: Mutex<RunState>,
    locks: KeyedLockRegistry,
    features: IdCache,
    geometries: DedupCache,
    textures: DedupCache,
    deferred: DeferredQueue,
    writer: BatchWriter,
    sequence: Arc<dyn IdSequence>,
    global: Option<Arc<dyn GlobalLookup>>,
    features_registered: AtomicUsize,
    dedup_hits: AtomicUsize,
    unresolved_final: AtomicUsize,
    config: ImportConfig,
}

impl ImportCoordinator {
    pub fn new(
        config: ImportConfig,
        executor: Arc<dyn StatementExecutor>,
        sequence: Arc<dyn IdSequence>,
        global: Option<Arc<dyn GlobalLookup>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(RunState::Init),
            locks: KeyedLockRegistry::new(),
            features: IdCache::with_capacity(config.cache_capacity),
            geometries: DedupCache::new(DedupKind::RelativeGeometry, config.cache_capacity),
            textures: DedupCache::new(DedupKind::TextureImage, config.cache_capacity),
            deferred: DeferredQueue::new(),
            writer: BatchWriter::new(executor, config.batch_threshold),
            sequence,
            global,
            features_registered: AtomicUsize::new(0),
            dedup_hits: AtomicUsize::new(0),
            unresolved_final: AtomicUsize::new(0),
            config,
        })
    }

    pub fn begin(&self) -> Result<()> {
        self.transition(RunState::Init, RunState::Streaming)?;
        info!(
            workers = self.config.worker_threads,
            batch_threshold = self.config.batch_threshold,
            "import run started"
        );
        Ok(())
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn writer(&self) -> &BatchWriter {
        &self.writer
    }

    /// A fresh surrogate id, for rows with no external key to cache.
    pub fn allocate_id(&self) -> Result<i64> {
        self.sequence.next_id()
    }

    /// The cached mapping for a feature key, if the key has been seen.
    pub fn resolve_feature(&self, external_key: &str) -> Option<CacheEntry> {
        self.features.lookup(external_key)
    }

    /// Look the feature key up, falling back to already-committed rows,
    /// and allocate a fresh surrogate id only when the key is genuinely
    /// new. Exactly one caller per key ever sees `created == true`;
    /// pending references on the key resolve before this returns.
    pub fn resolve_or_register(&self, external_key: &str, type_tag: i32) -> Result<Registration> {
        self.ensure_streaming()?;
        let _guard = self.locks.acquire(external_key);

        if let Some(entry) = self.features.lookup(external_key) {
            return Ok(Registration {
                entry,
                created: false,
            });
        }
        if let Some(global) = self.global.as_deref() {
            if let Some(stored) = global.find_feature(external_key)? {
                let entry = CacheEntry::global(stored.surrogate_id, stored.type_tag);
                self.features.register(external_key, entry.clone());
                self.deferred
                    .resolve_key(external_key, entry.surrogate_id, &self.writer)?;
                return Ok(Registration {
                    entry,
                    created: false,
                });
            }
        }

        let id = self.sequence.next_id()?;
        let mut entry = CacheEntry::session(id, type_tag);
        if self.config.rewrite_ids {
            entry = entry.with_replacement(format!("ID_{id}"));
        }
        self.features.register(external_key, entry.clone());
        self.features_registered.fetch_add(1, Ordering::Relaxed);
        self.deferred.resolve_key(external_key, id, &self.writer)?;
        Ok(Registration {
            entry,
            created: true,
        })
    }

    /// Dedup a texture by content digest. `insert` runs at most once per
    /// digest across the whole run and must write the row for the id it
    /// is given.
    pub fn get_or_insert_texture(
        &self,
        digest: &Digest,
        insert: impl FnOnce(i64) -> Result<()>,
    ) -> Result<Registration> {
        self.get_or_insert(&self.textures, digest, insert)
    }

    /// Dedup a relative geometry by content digest.
    pub fn get_or_insert_geometry(
        &self,
        digest: &Digest,
        insert: impl FnOnce(i64) -> Result<()>,
    ) -> Result<Registration> {
        self.get_or_insert(&self.geometries, digest, insert)
    }

    fn get_or_insert(
        &self,
        cache: &DedupCache,
        digest: &Digest,
        insert: impl FnOnce(i64) -> Result<()>,
    ) -> Result<Registration> {
        self.ensure_streaming()?;
        let key = digest.as_hex();
        let _guard = self.locks.acquire(key);

        if let Some(entry) = cache.lookup_with_fallback(key, self.global.as_deref())? {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            self.deferred
                .resolve_key(key, entry.surrogate_id, &self.writer)?;
            return Ok(Registration {
                entry,
                created: false,
            });
        }

        let id = self.sequence.next_id()?;
        insert(id)?;
        let entry = CacheEntry::session(id, 0);
        cache.register(key, entry.clone());
        self.deferred.resolve_key(key, id, &self.writer)?;
        Ok(Registration {
            entry,
            created: true,
        })
    }

    /// Queue a reference whose target has not been registered yet. If the
    /// target raced in between the importer's lookup and this call, the
    /// reference resolves immediately.
    pub fn enqueue_deferred(&self, reference: DeferredReference) -> Result<()> {
        self.ensure_streaming()?;
        let key = reference.forward_key.clone();
        let pool = reference.pool;
        let _guard = self.locks.acquire(&key);

        self.deferred.enqueue(reference);
        if let Some(id) = self.lookup_pool(pool, &key) {
            self.deferred.resolve_key(&key, id, &self.writer)?;
        }
        Ok(())
    }

    pub fn add_row(&self, spec: &TableSpec, row: BatchedRow) -> Result<()> {
        self.ensure_streaming()?;
        self.writer.add(spec, row)
    }

    /// Fan a parsed feature stream out over a worker pool, dispatching
    /// each feature to the importer registered for its type tag. Features
    /// with no registered importer are skipped with a warning.
    pub fn drive<F: Send>(
        &self,
        features: Vec<(i32, F)>,
        registry: &ImporterRegistry<F>,
    ) -> Result<()> {
        self.ensure_streaming()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.worker_threads)
            .build()
            .map_err(ImportError::config)?;
        pool.install(|| {
            features
                .into_par_iter()
                .try_for_each(|(type_tag, feature)| match registry.get(type_tag) {
                    Some(importer) => importer.import(&feature, self),
                    None => {
                        warn!(type_tag, "no importer registered for feature kind");
                        Ok(())
                    }
                })
        })
    }

    /// Stop accepting new features, flush everything buffered, then retry
    /// every pending reference once against the caches and the persistent
    /// fallback. Whatever still fails is removed, reported once, and left
    /// null in the store. In strict mode a non-empty unresolved set aborts
    /// the run instead.
    pub fn begin_drain(&self) -> Result<DrainReport> {
        self.transition(RunState::Streaming, RunState::Draining)?;
        self.writer.flush_all()?;

        let mut resolved = 0usize;
        for key in self.deferred.pending_keys() {
            let _guard = self.locks.acquire(&key);
            resolved += self.resolve_final(&key)?;
        }
        let unresolved = self.deferred.drain_unresolved();
        self.unresolved_final.store(unresolved.len(), Ordering::Relaxed);
        self.writer.flush_all()?;

        info!(
            resolved,
            unresolved = unresolved.len(),
            "final drain complete"
        );
        if self.config.strict && !unresolved.is_empty() {
            return Err(ImportError::UnresolvedReferences(unresolved.len()));
        }
        Ok(DrainReport {
            resolved,
            unresolved,
        })
    }

    fn resolve_final(&self, key: &str) -> Result<usize> {
        let Some(pool) = self.deferred.peek_pool(key) else {
            return Ok(0);
        };
        let id = match self.lookup_pool(pool, key) {
            Some(id) => Some(id),
            None => match self.global.as_deref() {
                None => None,
                Some(global) => match pool {
                    CachePool::Features => {
                        global.find_feature(key)?.map(|stored| stored.surrogate_id)
                    }
                    CachePool::Geometries => {
                        global.find_digest(DedupKind::RelativeGeometry, key)?
                    }
                    CachePool::Textures => global.find_digest(DedupKind::TextureImage, key)?,
                },
            },
        };
        match id {
            Some(id) => self.deferred.resolve_key(key, id, &self.writer),
            None => Ok(0),
        }
    }

    fn lookup_pool(&self, pool: CachePool, key: &str) -> Option<i64> {
        let entry = match pool {
            CachePool::Features => self.features.lookup(key),
            CachePool::Geometries => self.geometries.lookup(key),
            CachePool::Textures => self.textures.lookup(key),
        };
        entry.map(|e| e.surrogate_id)
    }

    pub fn close(&self) -> Result<ImportSummary> {
        self.transition(RunState::Draining, RunState::Closed)?;
        let summary = self.summary();
        if summary.references_unresolved > 0 {
            warn!(
                unresolved = summary.references_unresolved,
                "run closed with unresolved references"
            );
        }
        info!(
            features = summary.features_registered,
            rows = summary.rows_flushed,
            dedup_hits = summary.dedup_hits,
            "import run closed"
        );
        Ok(summary)
    }

    /// Force the run closed from any state. Buffered rows are dropped; the
    /// store keeps whatever batches were already flushed.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if *state != RunState::Closed {
            warn!(from = state.as_str(), "import run aborted");
            *state = RunState::Closed;
        }
    }

    pub fn summary(&self) -> ImportSummary {
        ImportSummary {
            features_registered: self.features_registered.load(Ordering::Relaxed),
            rows_flushed: self.writer.rows_flushed(),
            patches_flushed: self.writer.patches_flushed(),
            references_enqueued: self.deferred.enqueued_count(),
            references_resolved: self.deferred.resolved_count(),
            references_unresolved: self.unresolved_final.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, from: RunState, to: RunState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(ImportError::invalid_transition(state.as_str(), to.as_str()));
        }
        *state = to;
        Ok(())
    }

    // Mutating calls are Streaming-only. The drain is synchronous, so by
    // the time Draining is observable the final resolution pass and flush
    // already ran; anything accepted after that would be lost.
    fn ensure_streaming(&self) -> Result<()> {
        let state = *self.state.lock();
        match state {
            RunState::Streaming => Ok(()),
            other => Err(ImportError::invalid_transition(
                other.as_str(),
                RunState::Streaming.as_str(),
            )),
        }
    }
}
