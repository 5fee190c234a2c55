//! Per-table batch write buffer.
//!
//! Rows accumulate per destination table and flush as one multi-row
//! operation when the threshold is reached or on demand. Deferred-
//! reference patches batch the same way, keyed by (table, column).
//! Flush failures propagate to the caller synchronously; retry policy
//! belongs to the orchestrator.

use crate::error::Result;
use crate::model::{BatchedRow, TableSpec};
use crate::ports::StatementExecutor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

struct TableBatch {
    spec: TableSpec,
    rows: Vec<BatchedRow>,
}

struct PatchBatch {
    id_column: String,
    patches: Vec<(i64, i64)>,
}

pub struct BatchWriter {
    executor: Arc<dyn StatementExecutor>,
    threshold: usize,
    inserts: Mutex<HashMap<String, TableBatch>>,
    patches: Mutex<HashMap<(String, String), PatchBatch>>,
    rows_flushed: AtomicUsize,
    patches_flushed: AtomicUsize,
}

impl BatchWriter {
    pub fn new(executor: Arc<dyn StatementExecutor>, threshold: usize) -> Self {
        Self {
            executor,
            threshold,
            inserts: Mutex::new(HashMap::new()),
            patches: Mutex::new(HashMap::new()),
            rows_flushed: AtomicUsize::new(0),
            patches_flushed: AtomicUsize::new(0),
        }
    }

    /// Append a row; flushes the table synchronously once its pending
    /// count reaches the threshold.
    pub fn add(&self, spec: &TableSpec, row: BatchedRow) -> Result<()> {
        let full = {
            let mut inserts = self.inserts.lock();
            let batch = inserts
                .entry(spec.name.clone())
                .or_insert_with(|| TableBatch {
                    spec: spec.clone(),
                    rows: Vec::new(),
                });
            batch.rows.push(row);
            batch.rows.len() >= self.threshold
        };
        if full {
            self.flush_table(&spec.name)?;
        }
        Ok(())
    }

    /// Queue a targeted update: `SET column = value WHERE id_column = row_id`.
    pub fn add_patch(
        &self,
        table: &str,
        id_column: &str,
        column: &str,
        row_id: i64,
        value: i64,
    ) -> Result<()> {
        let full = {
            let mut patches = self.patches.lock();
            let batch = patches
                .entry((table.to_string(), column.to_string()))
                .or_insert_with(|| PatchBatch {
                    id_column: id_column.to_string(),
                    patches: Vec::new(),
                });
            batch.patches.push((row_id, value));
            batch.patches.len() >= self.threshold
        };
        if full {
            self.flush_patches(table, column)?;
        }
        Ok(())
    }

    pub fn flush_table(&self, table: &str) -> Result<()> {
        let taken = {
            let mut inserts = self.inserts.lock();
            match inserts.get_mut(table) {
                Some(batch) if !batch.rows.is_empty() => {
                    Some((batch.spec.clone(), std::mem::take(&mut batch.rows)))
                }
                _ => None,
            }
        };
        if let Some((spec, rows)) = taken {
            let count = rows.len();
            self.executor.insert_rows(&spec, &rows)?;
            self.rows_flushed.fetch_add(count, Ordering::Relaxed);
            debug!(table, rows = count, "flushed batch");
        }
        Ok(())
    }

    fn flush_patches(&self, table: &str, column: &str) -> Result<()> {
        let taken = {
            let mut patches = self.patches.lock();
            let key = (table.to_string(), column.to_string());
            match patches.get_mut(&key) {
                Some(batch) if !batch.patches.is_empty() => Some((
                    batch.id_column.clone(),
                    std::mem::take(&mut batch.patches),
                )),
                _ => None,
            }
        };
        if let Some((id_column, pairs)) = taken {
            let count = pairs.len();
            self.executor.patch_rows(table, &id_column, column, &pairs)?;
            self.patches_flushed.fetch_add(count, Ordering::Relaxed);
            debug!(table, column, patches = count, "flushed patches");
        }
        Ok(())
    }

    /// Flush every pending insert and patch. Cross-table order is
    /// unspecified; rows within a table keep arrival order.
    pub fn flush_all(&self) -> Result<()> {
        let tables: Vec<String> = self.inserts.lock().keys().cloned().collect();
        for table in tables {
            self.flush_table(&table)?;
        }
        let keys: Vec<(String, String)> = self.patches.lock().keys().cloned().collect();
        for (table, column) in keys {
            self.flush_patches(&table, &column)?;
        }
        Ok(())
    }

    pub fn rows_flushed(&self) -> usize {
        self.rows_flushed.load(Ordering::Relaxed)
    }

    pub fn patches_flushed(&self) -> usize {
        self.patches_flushed.load(Ordering::Relaxed)
    }

    pub fn pending_rows(&self) -> usize {
        self.inserts.lock().values().map(|b| b.rows.len()).sum()
    }
}
