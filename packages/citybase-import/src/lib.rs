/*
 * Citybase Import - Concurrent City-Model Import Core
 *
 * Coordination layer for streaming city-model documents into a relational
 * store.
 *
 * Architecture:
 * - Import Coordinator (lifecycle state machine)
 * - External-Id Cache + Content-Digest Dedup
 * - Deferred Cross-Reference Resolution
 * - Batched Writes (pluggable backend)
 * - Keyed Mutual Exclusion (blocking, per-key)
 */

// Public modules
pub mod batch;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod deferred;
pub mod error;
pub mod id_cache;
pub mod keyed_lock;
pub mod model;
pub mod ports;

// Re-exports
pub use batch::BatchWriter;
pub use config::ImportConfig;
pub use coordinator::{DrainReport, ImportCoordinator, ImportSummary, RunState};
pub use dedup::DedupCache;
pub use deferred::DeferredQueue;
pub use error::{ImportError, Result};
pub use id_cache::IdCache;
pub use keyed_lock::{KeyedLockGuard, KeyedLockRegistry};
pub use model::{
    BatchedRow, CacheEntry, CachePool, CacheScope, ColumnValue, DedupKind, DeferredKind,
    DeferredReference, Digest, Registration, StoredEntry, TableSpec, UnresolvedReference,
};
pub use ports::{
    FeatureImporter, GlobalLookup, IdSequence, ImporterRegistry, StatementExecutor,
};
