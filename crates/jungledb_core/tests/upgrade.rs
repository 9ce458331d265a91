//! Database lifecycle: versioning and upgrade conditions.

use jungledb_core::backend::{DatabaseBackend, MemoryDatabaseBackend};
use jungledb_core::{
    CoreError, Database, IndexOptions, ObjectStoreConfig, UpgradeCondition, Value,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn shared_backend() -> Arc<MemoryDatabaseBackend> {
    Arc::new(MemoryDatabaseBackend::new())
}

#[test]
fn version_zero_is_rejected() {
    let mut db = Database::volatile(0);
    assert!(matches!(
        db.connect(),
        Err(CoreError::InvalidOperation { .. })
    ));
}

#[test]
fn downgrade_is_rejected() {
    let backend = shared_backend();
    let mut db = Database::with_backend(backend.clone(), 3);
    db.create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    db.close().unwrap();

    let mut db = Database::with_backend(backend, 2);
    db.create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    assert!(matches!(db.connect(), Err(CoreError::Schema { .. })));
}

#[test]
fn structural_changes_require_disconnection() {
    let mut db = Database::volatile(1);
    let store = db
        .create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();

    assert!(matches!(
        db.create_object_store("other", ObjectStoreConfig::default()),
        Err(CoreError::Schema { .. })
    ));
    assert!(matches!(
        store.create_index("late", "x", IndexOptions::default()),
        Err(CoreError::Schema { .. })
    ));
}

#[test]
fn store_reads_require_connection() {
    let mut db = Database::volatile(1);
    let store = db
        .create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    assert!(matches!(
        store.get("k"),
        Err(CoreError::InvalidOperation { .. })
    ));
    db.connect().unwrap();
    assert_eq!(store.get("k").unwrap(), None);
}

#[test]
fn data_survives_reconnect_on_a_shared_backend() {
    let backend = shared_backend();

    let mut db = Database::with_backend(backend.clone(), 1);
    let store = db
        .create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    store.put("k", Value::Integer(1)).unwrap();
    db.close().unwrap();
    assert!(matches!(store.get("k"), Err(CoreError::InvalidOperation { .. })));

    let mut db = Database::with_backend(backend, 1);
    let store = db
        .create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    assert_eq!(store.get("k").unwrap(), Some(Value::Integer(1)));
}

#[test]
fn new_index_backfills_existing_data_on_version_bump() {
    let backend = shared_backend();

    let mut db = Database::with_backend(backend.clone(), 1);
    let store = db
        .create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    for (key, val) in [("a", 1), ("b", 2)] {
        store
            .put(key, Value::map(vec![("val", Value::Integer(val))]))
            .unwrap();
    }
    db.close().unwrap();

    let mut db = Database::with_backend(backend, 2);
    let store = db
        .create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    store
        .create_index("val_idx", "val", IndexOptions::default())
        .unwrap();
    db.connect().unwrap();

    assert_eq!(store.index("val_idx").unwrap().count(None).unwrap(), 2);
}

#[test]
fn new_structure_without_version_bump_is_a_schema_error() {
    let backend = shared_backend();

    let mut db = Database::with_backend(backend.clone(), 1);
    db.create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    db.close().unwrap();

    let mut db = Database::with_backend(backend, 1);
    db.create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.create_object_store("brand_new", ObjectStoreConfig::default())
        .unwrap();
    assert!(matches!(db.connect(), Err(CoreError::Schema { .. })));
}

#[test]
fn suppressed_index_is_not_installed() {
    let mut db = Database::volatile(1);
    let store = db
        .create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    store
        .create_index(
            "skipped",
            "val",
            IndexOptions::default().upgrade_condition(UpgradeCondition::Never),
        )
        .unwrap();
    db.connect().unwrap();

    assert!(matches!(
        store.index("skipped"),
        Err(CoreError::UnknownIndex { .. })
    ));
}

#[test]
fn forced_store_recreation_drops_data() {
    let backend = shared_backend();

    let mut db = Database::with_backend(backend.clone(), 1);
    let store = db
        .create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    store.put("k", Value::Integer(1)).unwrap();
    db.close().unwrap();

    let mut db = Database::with_backend(backend, 2);
    let store = db
        .create_object_store(
            "st",
            ObjectStoreConfig::default().upgrade_condition(UpgradeCondition::Always),
        )
        .unwrap();
    db.connect().unwrap();
    assert_eq!(store.get("k").unwrap(), None);
}

#[test]
fn conditional_upgrade_sees_both_versions() {
    let backend = shared_backend();
    let mut db = Database::with_backend(backend.clone(), 1);
    db.create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    db.close().unwrap();

    let mut db = Database::with_backend(backend, 4);
    let store = db
        .create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    store
        .create_index(
            "cond",
            "val",
            IndexOptions::default().upgrade_condition(UpgradeCondition::Func(Arc::new(
                |old, new| old == 1 && new == 4,
            ))),
        )
        .unwrap();
    db.connect().unwrap();
    assert!(store.index("cond").is_ok());
}

#[test]
fn deleting_a_store_requires_and_uses_a_version_bump() {
    let backend = shared_backend();

    let mut db = Database::with_backend(backend.clone(), 1);
    let store = db
        .create_object_store("doomed", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    store.put("k", Value::Integer(1)).unwrap();
    db.close().unwrap();

    // Same version: the delete is refused.
    let mut db = Database::with_backend(backend.clone(), 1);
    db.delete_object_store("doomed", UpgradeCondition::Default)
        .unwrap();
    assert!(matches!(db.connect(), Err(CoreError::Schema { .. })));

    // Bumped version: the store is dropped; re-declaring it later finds
    // it empty.
    let mut db = Database::with_backend(backend.clone(), 2);
    db.delete_object_store("doomed", UpgradeCondition::Default)
        .unwrap();
    db.connect().unwrap();
    db.close().unwrap();

    let mut db = Database::with_backend(backend, 3);
    let store = db
        .create_object_store("doomed", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    assert_eq!(store.count(None).unwrap(), 0);
}

#[test]
fn upgrade_callback_receives_old_and_new_version() {
    let backend = shared_backend();
    backend.set_version(2).unwrap();

    let seen = Arc::new(AtomicU32::new(0));
    let seen_in_callback = Arc::clone(&seen);
    let mut db = Database::with_backend(backend, 5).on_upgrade_needed(move |old, new| {
        seen_in_callback.store(old * 100 + new, Ordering::SeqCst);
    });
    db.create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 205);
}

#[test]
fn volatile_store_in_a_database_starts_empty_every_connect() {
    let backend = shared_backend();

    let mut db = Database::with_backend(backend.clone(), 1);
    let store = db
        .create_object_store("scratch", ObjectStoreConfig::default().volatile(true))
        .unwrap();
    db.connect().unwrap();
    store.put("k", Value::Integer(1)).unwrap();
    db.close().unwrap();

    let mut db = Database::with_backend(backend, 2);
    let store = db
        .create_object_store("scratch", ObjectStoreConfig::default().volatile(true))
        .unwrap();
    db.connect().unwrap();
    assert_eq!(store.get("k").unwrap(), None);
}

#[test]
fn destroy_wipes_the_backend() {
    let backend = shared_backend();
    let mut db = Database::with_backend(backend.clone(), 1);
    let store = db
        .create_object_store("st", ObjectStoreConfig::default())
        .unwrap();
    db.connect().unwrap();
    store.put("k", Value::Integer(1)).unwrap();
    db.destroy().unwrap();

    assert!(!backend.has_store("st").unwrap());
    assert_eq!(backend.version().unwrap(), 0);
}
