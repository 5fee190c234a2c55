//! Collaborator traits: what the surrounding application must provide.
//!
//! The core consumes the destination store through these narrow seams and
//! never sees a SQL dialect or a connection string.

use crate::coordinator::ImportCoordinator;
use crate::error::Result;
use crate::model::{BatchedRow, DedupKind, StoredEntry, TableSpec};
use std::collections::HashMap;

/// Produces fresh, globally unique surrogate identifiers.
pub trait IdSequence: Send + Sync {
    fn next_id(&self) -> Result<i64>;
}

/// Executes batched writes against the destination store.
pub trait StatementExecutor: Send + Sync {
    /// Execute one multi-row parameterized insert, rows in the given order.
    fn insert_rows(&self, table: &TableSpec, rows: &[BatchedRow]) -> Result<()>;

    /// Apply targeted updates: `SET column = id WHERE id_column = row_id`
    /// for each `(row_id, id)` pair.
    fn patch_rows(
        &self,
        table: &str,
        id_column: &str,
        column: &str,
        patches: &[(i64, i64)],
    ) -> Result<()>;
}

/// Read-only fallback lookups against already-committed rows.
///
/// An `Err` means the lookup failed, never that the content is absent;
/// callers must not conflate the two.
pub trait GlobalLookup: Send + Sync {
    fn find_feature(&self, external_key: &str) -> Result<Option<StoredEntry>>;

    fn find_digest(&self, kind: DedupKind, digest_hex: &str) -> Result<Option<i64>>;
}

/// Per-feature-kind row builder. One implementation per feature type in
/// the source document; the coordinator is agnostic to which concrete
/// builder produced a row.
pub trait FeatureImporter<F>: Send + Sync {
    fn type_tag(&self) -> i32;

    fn import(&self, feature: &F, ctx: &ImportCoordinator) -> Result<()>;
}

/// Dynamic-dispatch registry mapping a numeric type tag to its importer.
pub struct ImporterRegistry<F> {
    importers: HashMap<i32, Box<dyn FeatureImporter<F>>>,
}

impl<F> ImporterRegistry<F> {
    pub fn new() -> Self {
        Self {
            importers: HashMap::new(),
        }
    }

    pub fn register(&mut self, importer: Box<dyn FeatureImporter<F>>) {
        self.importers.insert(importer.type_tag(), importer);
    }

    pub fn get(&self, type_tag: i32) -> Option<&dyn FeatureImporter<F>> {
        self.importers.get(&type_tag).map(|b| b.as_ref())
    }

    pub fn len(&self) -> usize {
        self.importers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.importers.is_empty()
    }
}

impl<F> Default for ImporterRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}
