//! SQLite implementation of the import core's backend seams.
//!
//! One connection behind a mutex; batched inserts run as multi-row
//! statements inside a transaction, chunked to stay under SQLite's bind
//! parameter limit. The surrogate-id sequence is seeded from the highest
//! id already stored so re-imports into a non-empty store never collide.

use citybase_import::{
    BatchedRow, ColumnValue, DedupKind, GlobalLookup, IdSequence, ImportError, Result,
    StatementExecutor, StoredEntry, TableSpec,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

// Conservative bound under SQLITE_MAX_VARIABLE_NUMBER (999 by default).
const MAX_BIND_PARAMS: usize = 900;

/// Table and column names the backend needs to know about: where features
/// and their external keys live, and where content digests are stored.
#[derive(Debug, Clone)]
pub struct StoreSchema {
    /// Executed once at open, `CREATE TABLE IF NOT EXISTS` style.
    pub ddl: String,
    pub id_column: String,
    pub feature_table: String,
    pub feature_key_column: String,
    pub feature_type_column: String,
    pub texture_table: String,
    pub texture_digest_column: String,
    pub geometry_table: String,
    pub geometry_digest_column: String,
}

impl StoreSchema {
    /// The canonical city-model layout.
    pub fn city_model() -> Self {
        Self {
            ddl: CITY_MODEL_DDL.to_string(),
            id_column: "id".to_string(),
            feature_table: "feature".to_string(),
            feature_key_column: "external_key".to_string(),
            feature_type_column: "type_tag".to_string(),
            texture_table: "texture_image".to_string(),
            texture_digest_column: "digest".to_string(),
            geometry_table: "surface_geometry".to_string(),
            geometry_digest_column: "digest".to_string(),
        }
    }
}

impl Default for StoreSchema {
    fn default() -> Self {
        Self::city_model()
    }
}

const CITY_MODEL_DDL: &str = "
CREATE TABLE IF NOT EXISTS feature (
    id INTEGER PRIMARY KEY,
    external_key TEXT NOT NULL UNIQUE,
    type_tag INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS building (
    id INTEGER PRIMARY KEY,
    name TEXT,
    parent_id INTEGER,
    lod2_geometry_id INTEGER
);

CREATE TABLE IF NOT EXISTS surface_geometry (
    id INTEGER PRIMARY KEY,
    digest TEXT NOT NULL,
    geometry BLOB
);
CREATE INDEX IF NOT EXISTS idx_surface_geometry_digest
    ON surface_geometry(digest);

CREATE TABLE IF NOT EXISTS texture_image (
    id INTEGER PRIMARY KEY,
    digest TEXT NOT NULL,
    uri TEXT
);
CREATE INDEX IF NOT EXISTS idx_texture_image_digest
    ON texture_image(digest);

CREATE TABLE IF NOT EXISTS surface_texture (
    surface_id INTEGER NOT NULL,
    texture_id INTEGER NOT NULL
);
";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    schema: StoreSchema,
    sequence: AtomicI64,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(db_path: impl AsRef<Path>, schema: StoreSchema) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(ImportError::database)?;
        Self::init(conn, schema)
    }

    /// In-memory store, for testing.
    pub fn in_memory(schema: StoreSchema) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(ImportError::database)?;
        Self::init(conn, schema)
    }

    fn init(conn: Connection, schema: StoreSchema) -> Result<Self> {
        conn.execute_batch(&schema.ddl)
            .map_err(ImportError::database)?;
        let seed = Self::max_stored_id(&conn, &schema).map_err(ImportError::database)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            schema,
            sequence: AtomicI64::new(seed + 1),
        })
    }

    fn max_stored_id(conn: &Connection, schema: &StoreSchema) -> rusqlite::Result<i64> {
        let mut max = 0i64;
        for table in [
            &schema.feature_table,
            &schema.texture_table,
            &schema.geometry_table,
        ] {
            let sql = format!(
                "SELECT COALESCE(MAX({}), 0) FROM {}",
                schema.id_column, table
            );
            let stored: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            max = max.max(stored);
        }
        Ok(max)
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    /// Run a query returning a single integer. Test and tooling helper.
    pub fn query_scalar(&self, sql: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(sql, [], |row| row.get(0))
            .map_err(ImportError::database)
    }
}

fn to_sql_value(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Integer(v) => Value::Integer(*v),
        ColumnValue::Real(v) => Value::Real(*v),
        ColumnValue::Text(v) => Value::Text(v.clone()),
        ColumnValue::Blob(v) => Value::Blob(v.clone()),
    }
}

impl StatementExecutor for SqliteStore {
    fn insert_rows(&self, table: &TableSpec, rows: &[BatchedRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction().map_err(ImportError::database)?;

        let columns = table.columns.len().max(1);
        let rows_per_statement = (MAX_BIND_PARAMS / columns).max(1);
        let row_placeholder = format!("({})", vec!["?"; columns].join(", "));
        for chunk in rows.chunks(rows_per_statement) {
            let placeholders = vec![row_placeholder.as_str(); chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                table.name,
                table.columns.join(", "),
                placeholders
            );
            let values = chunk
                .iter()
                .flat_map(|row| row.values.iter().map(to_sql_value));
            tx.execute(&sql, params_from_iter(values))
                .map_err(ImportError::database)?;
        }

        tx.commit().map_err(ImportError::database)?;
        Ok(())
    }

    fn patch_rows(
        &self,
        table: &str,
        id_column: &str,
        column: &str,
        patches: &[(i64, i64)],
    ) -> Result<()> {
        if patches.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction().map_err(ImportError::database)?;
        {
            let sql = format!("UPDATE {table} SET {column} = ?1 WHERE {id_column} = ?2");
            let mut stmt = tx.prepare(&sql).map_err(ImportError::database)?;
            for (row_id, value) in patches {
                stmt.execute(params![value, row_id])
                    .map_err(ImportError::database)?;
            }
        }
        tx.commit().map_err(ImportError::database)?;
        Ok(())
    }
}

impl GlobalLookup for SqliteStore {
    fn find_feature(&self, external_key: &str) -> Result<Option<StoredEntry>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE {} = ?1",
            self.schema.id_column,
            self.schema.feature_type_column,
            self.schema.feature_table,
            self.schema.feature_key_column
        );
        conn.query_row(&sql, params![external_key], |row| {
            Ok(StoredEntry {
                surrogate_id: row.get(0)?,
                type_tag: row.get(1)?,
            })
        })
        .optional()
        .map_err(ImportError::database)
    }

    fn find_digest(&self, kind: DedupKind, digest_hex: &str) -> Result<Option<i64>> {
        let (table, column) = match kind {
            DedupKind::TextureImage => (
                &self.schema.texture_table,
                &self.schema.texture_digest_column,
            ),
            DedupKind::RelativeGeometry => (
                &self.schema.geometry_table,
                &self.schema.geometry_digest_column,
            ),
        };
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM {table} WHERE {column} = ?1 LIMIT 1",
            self.schema.id_column
        );
        conn.query_row(&sql, params![digest_hex], |row| row.get(0))
            .optional()
            .map_err(ImportError::database)
    }
}

impl IdSequence for SqliteStore {
    fn next_id(&self) -> Result<i64> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst))
    }
}
