//! Deferred cross-reference queue and resolver.
//!
//! A reference to an object not yet seen in the stream is queued as
//! pending instead of failing the importer. Registration of the target
//! key drains its pending references immediately (continuous drain); the
//! coordinator runs one exhaustive pass after streaming stops. References
//! on the same key resolve in enqueue order; cross-key order is
//! unspecified.

use crate::batch::BatchWriter;
use crate::error::Result;
use crate::model::{
    BatchedRow, CachePool, ColumnValue, DeferredKind, DeferredReference, TableSpec,
    UnresolvedReference,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

pub struct DeferredQueue {
    pending: DashMap<String, Vec<DeferredReference>>,
    enqueued: AtomicUsize,
    resolved: AtomicUsize,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            enqueued: AtomicUsize::new(0),
            resolved: AtomicUsize::new(0),
        }
    }

    /// Queue a reference as pending. Callers hold the keyed lock for
    /// `forward_key`, so per-key arrival order is well defined.
    pub fn enqueue(&self, reference: DeferredReference) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.pending
            .entry(reference.forward_key.clone())
            .or_default()
            .push(reference);
    }

    /// Drain every reference waiting on `key`, writing patches through the
    /// batch writer in enqueue order. Returns how many were resolved.
    pub fn resolve_key(&self, key: &str, resolved_id: i64, writer: &BatchWriter) -> Result<usize> {
        let references = self.take_key(key);
        let count = references.len();
        for reference in references {
            Self::apply(reference, resolved_id, writer)?;
        }
        if count > 0 {
            self.resolved.fetch_add(count, Ordering::Relaxed);
            debug!(key, count, "resolved deferred references");
        }
        Ok(count)
    }

    fn apply(reference: DeferredReference, resolved_id: i64, writer: &BatchWriter) -> Result<()> {
        match &reference.kind {
            DeferredKind::ColumnPatch { id_column } => writer.add_patch(
                &reference.target_table,
                id_column,
                &reference.anchor_column,
                reference.anchor_row_id,
                resolved_id,
            ),
            DeferredKind::LinkInsert { target_column } => {
                let mut columns = vec![reference.anchor_column.clone(), target_column.clone()];
                let mut values = vec![
                    ColumnValue::Integer(reference.anchor_row_id),
                    ColumnValue::Integer(resolved_id),
                ];
                // Auxiliary entries ride along as extra named columns,
                // sorted for a stable statement shape.
                let mut extra: Vec<_> = reference.auxiliary.iter().collect();
                extra.sort_by(|a, b| a.0.cmp(b.0));
                for (column, value) in extra {
                    columns.push(column.clone());
                    values.push(value.clone());
                }
                let spec = TableSpec {
                    name: reference.target_table.clone(),
                    columns,
                };
                writer.add(&spec, BatchedRow::new(values))
            }
        }
    }

    /// The pool the references on `key` resolve against, if any are
    /// pending. External keys are never shared across pools.
    pub fn peek_pool(&self, key: &str) -> Option<CachePool> {
        self.pending
            .get(key)
            .and_then(|refs| refs.first().map(|r| r.pool))
    }

    pub fn pending_keys(&self) -> Vec<String> {
        self.pending.iter().map(|e| e.key().clone()).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(|e| e.value().len()).sum()
    }

    fn take_key(&self, key: &str) -> Vec<DeferredReference> {
        self.pending.remove(key).map(|(_, v)| v).unwrap_or_default()
    }

    /// Remove and report everything still pending. Called once, after the
    /// final resolution pass has retried every key; each reference gets
    /// exactly one terminal report and its referencing column stays null.
    pub fn drain_unresolved(&self) -> Vec<UnresolvedReference> {
        let mut unresolved = Vec::new();
        for key in self.pending_keys() {
            for reference in self.take_key(&key) {
                warn!(
                    key = %reference.forward_key,
                    table = %reference.target_table,
                    row = reference.anchor_row_id,
                    "unresolved reference"
                );
                unresolved.push(UnresolvedReference { reference });
            }
        }
        unresolved
    }

    pub fn enqueued_count(&self) -> usize {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.load(Ordering::Relaxed)
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}
