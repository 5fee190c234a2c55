//! End-to-end import scenarios against a real SQLite store.

use citybase_import::{
    BatchedRow, CachePool, ColumnValue, DeferredReference, Digest, ImportConfig,
    ImportCoordinator, ImportError, TableSpec,
};
use citybase_sqlite::{SqliteStore, StoreSchema};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn config() -> ImportConfig {
    ImportConfig {
        worker_threads: 2,
        batch_threshold: 1,
        ..Default::default()
    }
}

fn coordinator(store: &Arc<SqliteStore>, config: ImportConfig) -> ImportCoordinator {
    ImportCoordinator::new(config, store.clone(), store.clone(), Some(store.clone())).unwrap()
}

fn feature_spec() -> TableSpec {
    TableSpec::new("feature", &["id", "external_key", "type_tag"])
}

fn building_spec() -> TableSpec {
    TableSpec::new("building", &["id", "name", "lod2_geometry_id"])
}

fn geometry_spec() -> TableSpec {
    TableSpec::new("surface_geometry", &["id", "digest"])
}

fn texture_spec() -> TableSpec {
    TableSpec::new("texture_image", &["id", "digest", "uri"])
}

fn import_building(ctx: &ImportCoordinator, key: &str, name: &str) -> i64 {
    let registration = ctx.resolve_or_register(key, 26).unwrap();
    assert!(registration.created);
    let id = registration.entry.surrogate_id;
    ctx.add_row(
        &feature_spec(),
        BatchedRow::new(vec![
            ColumnValue::Integer(id),
            ColumnValue::Text(key.to_string()),
            ColumnValue::Integer(26),
        ]),
    )
    .unwrap();
    ctx.add_row(
        &building_spec(),
        BatchedRow::new(vec![
            ColumnValue::Integer(id),
            ColumnValue::Text(name.to_string()),
            ColumnValue::Null,
        ]),
    )
    .unwrap();
    id
}

#[test]
fn test_forward_reference_patched_once_target_arrives() {
    let store = Arc::new(SqliteStore::in_memory(StoreSchema::city_model()).unwrap());
    let ctx = coordinator(&store, config());
    ctx.begin().unwrap();

    // The building streams in before the geometry it references.
    let building_id = import_building(&ctx, "bldg-1", "hall");
    let digest = Digest::of("geom:hall-roof");
    ctx.enqueue_deferred(
        DeferredReference::column_patch(
            CachePool::Geometries,
            "building",
            building_id,
            "lod2_geometry_id",
            digest.as_hex(),
        ),
    )
    .unwrap();

    let geometry = ctx
        .get_or_insert_geometry(&digest, |id| {
            ctx.add_row(
                &geometry_spec(),
                BatchedRow::new(vec![
                    ColumnValue::Integer(id),
                    ColumnValue::Text(digest.as_hex().to_string()),
                ]),
            )
        })
        .unwrap();

    let report = ctx.begin_drain().unwrap();
    assert!(report.unresolved.is_empty());
    ctx.close().unwrap();

    let patched = store
        .query_scalar(&format!(
            "SELECT lod2_geometry_id FROM building WHERE id = {building_id}"
        ))
        .unwrap();
    assert_eq!(patched, geometry.entry.surrogate_id);
}

#[test]
fn test_texture_dedup_survives_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("city.db");
    let digest = Digest::of("tex/roof.jpg");

    let first_id = {
        let store = Arc::new(SqliteStore::open(&path, StoreSchema::city_model()).unwrap());
        let ctx = coordinator(&store, config());
        ctx.begin().unwrap();
        let registration = ctx
            .get_or_insert_texture(&digest, |id| {
                ctx.add_row(
                    &texture_spec(),
                    BatchedRow::new(vec![
                        ColumnValue::Integer(id),
                        ColumnValue::Text(digest.as_hex().to_string()),
                        ColumnValue::Text("tex/roof.jpg".to_string()),
                    ]),
                )
            })
            .unwrap();
        assert!(registration.created);
        ctx.begin_drain().unwrap();
        ctx.close().unwrap();
        registration.entry.surrogate_id
    };

    // A second run against the same store finds the committed row.
    let store = Arc::new(SqliteStore::open(&path, StoreSchema::city_model()).unwrap());
    let ctx = coordinator(&store, config());
    ctx.begin().unwrap();
    let registration = ctx
        .get_or_insert_texture(&digest, |_id| {
            panic!("insert must not run for a known digest")
        })
        .unwrap();
    assert!(!registration.created);
    assert_eq!(registration.entry.surrogate_id, first_id);
    ctx.begin_drain().unwrap();
    ctx.close().unwrap();

    let count = store
        .query_scalar("SELECT COUNT(*) FROM texture_image")
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_concurrent_duplicate_digest_inserts_once() {
    let store = Arc::new(SqliteStore::in_memory(StoreSchema::city_model()).unwrap());
    let ctx = coordinator(&store, config());
    ctx.begin().unwrap();
    let digest = Digest::of("geom:shared-tree");
    let inserts = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                ctx.get_or_insert_geometry(&digest, |id| {
                    inserts.fetch_add(1, Ordering::SeqCst);
                    ctx.add_row(
                        &geometry_spec(),
                        BatchedRow::new(vec![
                            ColumnValue::Integer(id),
                            ColumnValue::Text(digest.as_hex().to_string()),
                        ]),
                    )
                })
                .unwrap();
            });
        }
    });

    ctx.begin_drain().unwrap();
    let summary = ctx.close().unwrap();
    assert_eq!(inserts.load(Ordering::SeqCst), 1);
    assert_eq!(summary.dedup_hits, 7);
    assert_eq!(
        store
            .query_scalar("SELECT COUNT(*) FROM surface_geometry")
            .unwrap(),
        1
    );
}

#[test]
fn test_batch_threshold_flushes_during_streaming() {
    let store = Arc::new(SqliteStore::in_memory(StoreSchema::city_model()).unwrap());
    let mut config = config();
    config.batch_threshold = 3;
    let ctx = coordinator(&store, config);
    ctx.begin().unwrap();

    for i in 1..=3 {
        ctx.add_row(
            &feature_spec(),
            BatchedRow::new(vec![
                ColumnValue::Integer(i),
                ColumnValue::Text(format!("bldg-{i}")),
                ColumnValue::Integer(26),
            ]),
        )
        .unwrap();
    }

    // The third row crossed the threshold; no drain needed yet.
    assert_eq!(
        store.query_scalar("SELECT COUNT(*) FROM feature").unwrap(),
        3
    );
    assert_eq!(ctx.writer().pending_rows(), 0);
    ctx.begin_drain().unwrap();
    ctx.close().unwrap();
}

#[test]
fn test_unresolved_reference_leaves_column_null() {
    let store = Arc::new(SqliteStore::in_memory(StoreSchema::city_model()).unwrap());
    let ctx = coordinator(&store, config());
    ctx.begin().unwrap();

    let building_id = import_building(&ctx, "bldg-1", "hall");
    ctx.enqueue_deferred(DeferredReference::column_patch(
        CachePool::Geometries,
        "building",
        building_id,
        "lod2_geometry_id",
        "never-arrives",
    ))
    .unwrap();

    let report = ctx.begin_drain().unwrap();
    assert_eq!(report.unresolved.len(), 1);
    assert_eq!(report.unresolved[0].reference.forward_key, "never-arrives");
    let summary = ctx.close().unwrap();
    assert_eq!(summary.references_unresolved, 1);

    let nulls = store
        .query_scalar(&format!(
            "SELECT COUNT(*) FROM building WHERE id = {building_id} AND lod2_geometry_id IS NULL"
        ))
        .unwrap();
    assert_eq!(nulls, 1);
}

#[test]
fn test_strict_mode_aborts_on_unresolved() {
    let store = Arc::new(SqliteStore::in_memory(StoreSchema::city_model()).unwrap());
    let mut config = config();
    config.strict = true;
    let ctx = coordinator(&store, config);
    ctx.begin().unwrap();

    let building_id = import_building(&ctx, "bldg-1", "hall");
    ctx.enqueue_deferred(DeferredReference::column_patch(
        CachePool::Features,
        "building",
        building_id,
        "parent_id",
        "ghost-parent",
    ))
    .unwrap();

    let err = ctx.begin_drain().unwrap_err();
    assert!(matches!(err, ImportError::UnresolvedReferences(1)));
    ctx.abort();
}

#[test]
fn test_reimport_into_populated_store_avoids_id_collisions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("city.db");

    {
        let store = Arc::new(SqliteStore::open(&path, StoreSchema::city_model()).unwrap());
        let ctx = coordinator(&store, config());
        ctx.begin().unwrap();
        import_building(&ctx, "bldg-1", "hall");
        ctx.begin_drain().unwrap();
        ctx.close().unwrap();
    }

    let store = Arc::new(SqliteStore::open(&path, StoreSchema::city_model()).unwrap());
    let ctx = coordinator(&store, config());
    ctx.begin().unwrap();
    // A known key resolves to its stored row instead of a new id.
    let existing = ctx.resolve_or_register("bldg-1", 26).unwrap();
    assert!(!existing.created);
    // A new key gets an id past everything already stored.
    let fresh = import_building(&ctx, "bldg-2", "tower");
    assert!(fresh > existing.entry.surrogate_id);
    ctx.begin_drain().unwrap();
    ctx.close().unwrap();

    assert_eq!(
        store.query_scalar("SELECT COUNT(*) FROM feature").unwrap(),
        2
    );
    assert_eq!(
        store
            .query_scalar("SELECT COUNT(DISTINCT id) FROM feature")
            .unwrap(),
        2
    );
}
