//! Shared data model: row payloads, cache entries, deferred references.
//!
//! Rows and references are deliberately opaque to the coordinator; the
//! per-feature importers decide what goes into them.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;

/// A single column value bound into a parameterized statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Destination-table layout for batched inserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<String>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
        }
    }
}

/// One row of positional values for a specific `TableSpec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedRow {
    pub values: Vec<ColumnValue>,
}

impl BatchedRow {
    pub fn new(values: Vec<ColumnValue>) -> Self {
        Self { values }
    }
}

/// SHA-256 content digest, lowercase hex. The hex string doubles as the
/// cache key for content-addressable deduplication; collision is treated
/// as identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(String);

impl Digest {
    /// Digest a resource identity (a texture path, a relative-geometry
    /// identity string).
    pub fn of(identity: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        let hex = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Self(hex)
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

/// Where a cache entry came from. `Global` entries were discovered by
/// querying already-committed rows and must never be re-inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheScope {
    Session,
    Global,
}

impl CacheScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheScope::Session => "session",
            CacheScope::Global => "global",
        }
    }
}

/// Surrogate-id mapping for one external key. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub surrogate_id: i64,
    /// Present only when identifiers are rewritten on import; this is the
    /// key output rows carry, while the original stays valid for lookups.
    pub replacement_key: Option<String>,
    pub type_tag: i32,
    pub scope: CacheScope,
}

impl CacheEntry {
    pub fn session(surrogate_id: i64, type_tag: i32) -> Self {
        Self {
            surrogate_id,
            replacement_key: None,
            type_tag,
            scope: CacheScope::Session,
        }
    }

    pub fn global(surrogate_id: i64, type_tag: i32) -> Self {
        Self {
            surrogate_id,
            replacement_key: None,
            type_tag,
            scope: CacheScope::Global,
        }
    }

    pub fn with_replacement(mut self, key: impl Into<String>) -> Self {
        self.replacement_key = Some(key.into());
        self
    }

    /// The key to write into output rows: the replacement when identifiers
    /// are rewritten, the original otherwise.
    pub fn output_key<'a>(&'a self, original: &'a str) -> &'a str {
        self.replacement_key.as_deref().unwrap_or(original)
    }
}

/// Outcome of a resolve-or-register call. `created == false` means the
/// resource already exists; reuse its surrogate id, never re-insert.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub entry: CacheEntry,
    pub created: bool,
}

/// A row found in the destination store by a persistent fallback lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredEntry {
    pub surrogate_id: i64,
    pub type_tag: i32,
}

/// Which content-addressable cache a digest belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DedupKind {
    TextureImage,
    RelativeGeometry,
}

impl DedupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupKind::TextureImage => "texture_image",
            DedupKind::RelativeGeometry => "relative_geometry",
        }
    }
}

/// Which cache a deferred reference resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CachePool {
    Features,
    Geometries,
    Textures,
}

impl CachePool {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePool::Features => "features",
            CachePool::Geometries => "geometries",
            CachePool::Textures => "textures",
        }
    }
}

/// How a resolved reference is written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeferredKind {
    /// Patch `anchor_column` of the anchor row:
    /// `UPDATE target_table SET anchor_column = <resolved> WHERE id_column = anchor_row_id`.
    ColumnPatch { id_column: String },
    /// Insert `(anchor_row_id, <resolved>)` into `target_table`, with
    /// `anchor_column` naming the source column.
    LinkInsert { target_column: String },
}

/// "Once `forward_key` resolves to a surrogate id, write it back."
///
/// Created when an importer encounters a reference whose target is not in
/// any cache yet; the referencing column is left null in the meantime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredReference {
    pub pool: CachePool,
    pub target_table: String,
    pub anchor_row_id: i64,
    pub anchor_column: String,
    pub forward_key: String,
    pub kind: DeferredKind,
    /// Type-specific resolution payload. Link inserts write each entry as
    /// an extra named column of the link row; column patches cannot carry
    /// extra columns, there the payload survives only into unresolved
    /// reports.
    pub auxiliary: HashMap<String, ColumnValue>,
}

impl DeferredReference {
    pub fn column_patch(
        pool: CachePool,
        target_table: impl Into<String>,
        anchor_row_id: i64,
        anchor_column: impl Into<String>,
        forward_key: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            target_table: target_table.into(),
            anchor_row_id,
            anchor_column: anchor_column.into(),
            forward_key: forward_key.into(),
            kind: DeferredKind::ColumnPatch {
                id_column: "id".to_string(),
            },
            auxiliary: HashMap::new(),
        }
    }

    pub fn link_insert(
        pool: CachePool,
        link_table: impl Into<String>,
        source_column: impl Into<String>,
        target_column: impl Into<String>,
        anchor_row_id: i64,
        forward_key: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            target_table: link_table.into(),
            anchor_row_id,
            anchor_column: source_column.into(),
            forward_key: forward_key.into(),
            kind: DeferredKind::LinkInsert {
                target_column: target_column.into(),
            },
            auxiliary: HashMap::new(),
        }
    }

    pub fn with_id_column(mut self, id_column: impl Into<String>) -> Self {
        if let DeferredKind::ColumnPatch { id_column: column } = &mut self.kind {
            *column = id_column.into();
        }
        self
    }

    pub fn with_auxiliary(mut self, key: impl Into<String>, value: ColumnValue) -> Self {
        self.auxiliary.insert(key.into(), value);
        self
    }
}

/// Terminal report for a reference whose target never appeared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub reference: DeferredReference,
}
