use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use lockdoc_core::{
    ActorId, Entity, EntityId, FieldPath, HistoricEntry, HistoricKind, Stamp, Value,
};
use lockdoc_storage::{DocumentStore, MemoryStore, SqliteStore, StorageError};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn entity(json: serde_json::Value) -> Entity {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    Entity::new(Value::from(json), Stamp::new(&ActorId::from("u"), at)).unwrap()
}

fn entry(snapshot: &Entity, actor: &str, offset_secs: i64) -> HistoricEntry {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_secs);
    HistoricEntry::new(HistoricKind::Update, snapshot.clone(), &ActorId::from(actor), at).unwrap()
}

fn stores() -> Result<Vec<(&'static str, Box<dyn DocumentStore>)>, StorageError> {
    Ok(vec![
        ("memory", Box::new(MemoryStore::new()) as Box<dyn DocumentStore>),
        ("sqlite", Box::new(SqliteStore::open_in_memory()?) as Box<dyn DocumentStore>),
    ])
}

// ============================================================================
// Documents
// ============================================================================

#[test]
fn insert_get_and_collision() -> TestResult {
    for (name, mut store) in stores()? {
        let e = entity(json!({ "a": 1 }));
        store.insert("c", &e)?;
        assert_eq!(store.get("c", e.id)?, Some(e.clone()), "{name}");
        assert_eq!(store.get("other", e.id)?, None, "{name}: collections are separate");

        let err = store.insert("c", &e).unwrap_err();
        assert!(matches!(err, StorageError::EntityCollision { .. }), "{name}");
    }
    Ok(())
}

#[test]
fn conditional_replace_checks_version() -> TestResult {
    for (name, mut store) in stores()? {
        let e = entity(json!({ "a": 1 }));
        store.insert("c", &e)?;

        let mut next = e.clone();
        next.body = Value::from(json!({ "a": 2 }));
        let written = store.conditional_replace("c", 1, &next)?;
        assert_eq!(written.version, 2, "{name}");
        assert_eq!(store.get("c", e.id)?, Some(written), "{name}");

        let err = store.conditional_replace("c", 1, &next).unwrap_err();
        assert!(err.is_conflict(), "{name}");
        assert!(
            matches!(err, StorageError::Conflict { expected: 1, actual: Some(2), .. }),
            "{name}: {err}"
        );

        let missing = entity(json!({}));
        let err = store.conditional_replace("c", 1, &missing).unwrap_err();
        assert!(matches!(err, StorageError::Conflict { actual: None, .. }), "{name}");
    }
    Ok(())
}

#[test]
fn update_at_path_writes_nested_value() -> TestResult {
    for (name, mut store) in stores()? {
        let e = entity(json!({ "a": { "b": 1 }, "list": [{ "id": "x", "v": 1 }] }));
        store.insert("c", &e)?;

        let mut metadata = e.metadata.clone();
        metadata.last_update = Some(Stamp::new(&ActorId::from("w"), Utc::now()));
        let path = FieldPath::parse("list[id=x].v")?;
        let written = store.update_at_path("c", e.id, 1, &path, &Value::Integer(5), &metadata)?;
        assert_eq!(written.version, 2, "{name}");
        assert_eq!(written.metadata, metadata, "{name}");
        assert_eq!(
            written.body.to_json(),
            json!({ "a": { "b": 1 }, "list": [{ "id": "x", "v": 5 }] }),
            "{name}"
        );

        let err = store
            .update_at_path("c", e.id, 1, &path, &Value::Integer(6), &metadata)
            .unwrap_err();
        assert!(err.is_conflict(), "{name}");

        let bad = FieldPath::parse("list[id=nope].v")?;
        assert!(store
            .update_at_path("c", e.id, 2, &bad, &Value::Null, &metadata)
            .is_err());
        assert_eq!(store.get("c", e.id)?.map(|e| e.version), Some(2), "{name}");
    }
    Ok(())
}

#[test]
fn delete_count_and_list() -> TestResult {
    for (name, mut store) in stores()? {
        let first = entity(json!({ "n": 1 }));
        let second = entity(json!({ "n": 2 }));
        store.insert("c", &first)?;
        store.insert("c", &second)?;
        store.insert("d", &entity(json!({ "n": 3 })))?;
        assert_eq!(store.count("c")?, 2, "{name}");

        let listed: Vec<EntityId> = store.list("c")?.iter().map(|e| e.id).collect();
        assert_eq!(listed, vec![first.id, second.id], "{name}");

        let err = store.delete("c", first.id, 7).unwrap_err();
        assert!(err.is_conflict(), "{name}");
        store.delete("c", first.id, 1)?;
        assert_eq!(store.count("c")?, 1, "{name}");
        assert!(store.delete("c", first.id, 1).unwrap_err().is_conflict(), "{name}");
    }
    Ok(())
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn rollback_discards_writes() -> TestResult {
    for (name, mut store) in stores()? {
        let kept = entity(json!({ "n": 1 }));
        store.insert("c", &kept)?;

        store.begin()?;
        store.insert("c", &entity(json!({ "n": 2 })))?;
        store.append_historic("c", &entry(&kept, "u", 0))?;
        store.rollback()?;

        assert_eq!(store.count("c")?, 1, "{name}");
        assert!(store.historic_for_entity("c", kept.id)?.is_empty(), "{name}");

        store.begin()?;
        store.insert("c", &entity(json!({ "n": 3 })))?;
        store.commit()?;
        assert_eq!(store.count("c")?, 2, "{name}");
    }
    Ok(())
}

#[test]
fn transaction_state_is_checked() -> TestResult {
    for (name, mut store) in stores()? {
        assert!(matches!(store.commit(), Err(StorageError::Transaction(_))), "{name}");
        assert!(matches!(store.rollback(), Err(StorageError::Transaction(_))), "{name}");
        store.begin()?;
        assert!(matches!(store.begin(), Err(StorageError::Transaction(_))), "{name}");
        store.rollback()?;
    }
    Ok(())
}

// ============================================================================
// Historic
// ============================================================================

#[test]
fn historic_orders_by_date_then_insertion() -> TestResult {
    for (name, mut store) in stores()? {
        let e = entity(json!({ "n": 1 }));
        let late = entry(&e, "a", 30);
        let early = entry(&e, "a", 10);
        let tie_first = entry(&e, "b", 20);
        let tie_second = entry(&e, "b", 20);
        for item in [&late, &early, &tie_first, &tie_second] {
            store.append_historic("c", item)?;
        }

        let ids: Vec<_> = store
            .historic_for_entity("c", e.id)?
            .iter()
            .map(|entry| entry.id)
            .collect();
        assert_eq!(ids, vec![early.id, tie_first.id, tie_second.id, late.id], "{name}");

        let recent_a = store.most_recent_historic_by_actor("c", e.id, &ActorId::from("a"))?;
        assert_eq!(recent_a.map(|entry| entry.id), Some(late.id), "{name}");
        let recent_b = store.most_recent_historic_by_actor("c", e.id, &ActorId::from("b"))?;
        assert_eq!(recent_b.map(|entry| entry.id), Some(tie_second.id), "{name}");
        let nobody = store.most_recent_historic_by_actor("c", e.id, &ActorId::from("z"))?;
        assert!(nobody.is_none(), "{name}");
    }
    Ok(())
}

#[test]
fn historic_round_trips_exactly() -> TestResult {
    for (name, mut store) in stores()? {
        let e = entity(json!({ "when": "x", "nested": { "list": [1, 2.5, null, true] } }));
        let written = entry(&e, "u", 1);
        store.append_historic("c", &written)?;
        let read = store.historic_for_entity("c", e.id)?;
        assert_eq!(read, vec![written], "{name}");
    }
    Ok(())
}

#[test]
fn sqlite_historic_is_append_only() -> TestResult {
    let mut store = SqliteStore::open_in_memory()?;
    let e = entity(json!({ "n": 1 }));
    store.append_historic("c", &entry(&e, "u", 0))?;

    let update = store
        .conn()
        .execute("UPDATE historic SET user_id = 'forged'", []);
    assert!(update.is_err());
    let delete = store.conn().execute("DELETE FROM historic", []);
    assert!(delete.is_err());
    assert_eq!(store.historic_for_entity("c", e.id)?.len(), 1);
    Ok(())
}

#[test]
fn sqlite_detects_tampered_snapshot() -> TestResult {
    let mut store = SqliteStore::open_in_memory()?;
    let e = entity(json!({ "n": 1 }));
    let mut forged = entry(&e, "u", 0);
    forged.snapshot.body = Value::from(json!({ "n": 2 }));
    store.append_historic("c", &forged)?;

    let err = store.historic_for_entity("c", e.id).unwrap_err();
    assert!(matches!(err, StorageError::Sqlite(_)), "{err}");
    Ok(())
}

#[test]
fn sqlite_reopen_keeps_documents() -> TestResult {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("reopen.db");
    let path = path.to_string_lossy();
    let e = entity(json!({ "a.b": 1 }));
    {
        let mut store = SqliteStore::open(&path)?;
        store.insert("c", &e)?;
        store.append_historic("c", &entry(&e, "u", 0))?;
    }
    let store = SqliteStore::open(&path)?;
    assert_eq!(store.get("c", e.id)?, Some(e.clone()));
    assert_eq!(store.historic_for_entity("c", e.id)?.len(), 1);
    Ok(())
}
