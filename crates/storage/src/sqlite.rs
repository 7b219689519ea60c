use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};

use lockdoc_core::{
    ActorId, Entity, EntityId, EntityMetadata, FieldPath, HistoricEntry, HistoricId, HistoricKind,
    Value, path::set_at_path,
};

use crate::error::StorageError;
use crate::traits::{DocumentStore, conflict};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

/// Fixed-width UTC text, so lexical order is chronological order.
fn date_text(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_date(text: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("invalid date {text:?}: {e}")))
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn load_entity(
    conn: &Connection,
    collection: &str,
    id: EntityId,
) -> Result<Option<Entity>, StorageError> {
    let row = conn
        .query_row(
            "SELECT version, payload FROM documents WHERE collection = ?1 AND entity_id = ?2",
            rusqlite::params![collection, id.as_bytes().as_slice()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )
        .optional()?;

    match row {
        Some((version, payload)) => {
            let mut entity = Entity::from_msgpack(&payload)?;
            entity.version = version as u64;
            Ok(Some(entity))
        }
        None => Ok(None),
    }
}

fn stored_version(
    conn: &Connection,
    collection: &str,
    id: EntityId,
) -> Result<Option<u64>, StorageError> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM documents WHERE collection = ?1 AND entity_id = ?2",
            rusqlite::params![collection, id.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|v| v as u64))
}

fn replace_row(
    conn: &Connection,
    collection: &str,
    expected_version: u64,
    entity: &Entity,
) -> Result<Entity, StorageError> {
    let mut written = entity.clone();
    written.version = expected_version + 1;
    let payload = written.to_msgpack()?;
    let updated_at = written
        .metadata
        .last_update
        .as_ref()
        .map(|stamp| date_text(&stamp.date));

    let changed = conn.execute(
        "UPDATE documents SET version = ?1, payload = ?2, updated_at = ?3 WHERE collection = ?4 AND entity_id = ?5 AND version = ?6",
        rusqlite::params![
            written.version as i64,
            payload,
            updated_at,
            collection,
            entity.id.as_bytes().as_slice(),
            expected_version as i64,
        ],
    )?;
    if changed == 0 {
        let actual = stored_version(conn, collection, entity.id)?;
        return Err(conflict(entity.id, expected_version, actual));
    }
    Ok(written)
}

fn read_historic(row: &rusqlite::Row) -> Result<HistoricEntry, StorageError> {
    let historic_id_bytes: Vec<u8> = row.get(0)?;
    let entity_id_bytes: Vec<u8> = row.get(1)?;
    let user_id: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let date: String = row.get(4)?;
    let snapshot_bytes: Vec<u8> = row.get(5)?;
    let checksum_bytes: Vec<u8> = row.get(6)?;

    let entry = HistoricEntry {
        id: HistoricId::from_bytes(to_array::<16>(historic_id_bytes, "historic_id")?),
        entity_id: EntityId::from_bytes(to_array::<16>(entity_id_bytes, "entity_id")?),
        user_id: ActorId::new(user_id),
        snapshot: Entity::from_msgpack(&snapshot_bytes)?,
        date: parse_date(&date)?,
        kind: HistoricKind::parse(&kind)?,
        checksum: to_array::<32>(checksum_bytes, "checksum")?,
    };
    entry.verify()?;
    Ok(entry)
}

fn tunnel(e: StorageError) -> rusqlite::Error {
    match e {
        StorageError::Sqlite(sq) => sq,
        other => rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Blob,
            Box::new(OpaqueStorageError(other.to_string())),
        ),
    }
}

impl DocumentStore for SqliteStore {
    fn get(&self, collection: &str, id: EntityId) -> Result<Option<Entity>, StorageError> {
        load_entity(&self.conn, collection, id)
    }

    fn insert(&mut self, collection: &str, entity: &Entity) -> Result<(), StorageError> {
        let payload = entity.to_msgpack()?;
        let result = self.conn.execute(
            "INSERT INTO documents (collection, entity_id, version, payload, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            rusqlite::params![
                collection,
                entity.id.as_bytes().as_slice(),
                entity.version as i64,
                payload,
                date_text(&entity.metadata.creation.date),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::EntityCollision {
                    entity_id: entity.id.to_string(),
                })
            }
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn conditional_replace(
        &mut self,
        collection: &str,
        expected_version: u64,
        entity: &Entity,
    ) -> Result<Entity, StorageError> {
        replace_row(&self.conn, collection, expected_version, entity)
    }

    fn update_at_path(
        &mut self,
        collection: &str,
        id: EntityId,
        expected_version: u64,
        path: &FieldPath,
        value: &Value,
        metadata: &EntityMetadata,
    ) -> Result<Entity, StorageError> {
        // A savepoint nests inside a transaction opened with `begin`.
        let sp = self.conn.savepoint()?;
        let mut entity = match load_entity(&sp, collection, id)? {
            Some(entity) if entity.version == expected_version => entity,
            Some(entity) => return Err(conflict(id, expected_version, Some(entity.version))),
            None => return Err(conflict(id, expected_version, None)),
        };
        set_at_path(&mut entity.body, path, value.clone())?;
        entity.metadata = metadata.clone();
        let written = replace_row(&sp, collection, expected_version, &entity)?;
        sp.commit()?;
        Ok(written)
    }

    fn delete(
        &mut self,
        collection: &str,
        id: EntityId,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND entity_id = ?2 AND version = ?3",
            rusqlite::params![collection, id.as_bytes().as_slice(), expected_version as i64],
        )?;
        if changed == 0 {
            let actual = stored_version(&self.conn, collection, id)?;
            return Err(conflict(id, expected_version, actual));
        }
        Ok(())
    }

    fn count(&self, collection: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            rusqlite::params![collection],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn list(&self, collection: &str) -> Result<Vec<Entity>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT version, payload FROM documents WHERE collection = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(rusqlite::params![collection], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (version, payload) = row?;
            let mut entity = Entity::from_msgpack(&payload)?;
            entity.version = version as u64;
            result.push(entity);
        }
        Ok(result)
    }

    fn append_historic(
        &mut self,
        collection: &str,
        entry: &HistoricEntry,
    ) -> Result<(), StorageError> {
        let snapshot = entry.snapshot.to_msgpack()?;
        self.conn.execute(
            "INSERT INTO historic (historic_id, collection, entity_id, user_id, kind, date, snapshot, checksum) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                entry.id.as_bytes().as_slice(),
                collection,
                entry.entity_id.as_bytes().as_slice(),
                entry.user_id.as_str(),
                entry.kind.as_str(),
                date_text(&entry.date),
                snapshot,
                &entry.checksum[..],
            ],
        )?;
        Ok(())
    }

    fn historic_for_entity(
        &self,
        collection: &str,
        id: EntityId,
    ) -> Result<Vec<HistoricEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT historic_id, entity_id, user_id, kind, date, snapshot, checksum FROM historic WHERE collection = ?1 AND entity_id = ?2 ORDER BY date, seq",
        )?;
        let entries = stmt
            .query_map(rusqlite::params![collection, id.as_bytes().as_slice()], |row| {
                read_historic(row).map_err(tunnel)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn most_recent_historic_by_actor(
        &self,
        collection: &str,
        id: EntityId,
        actor: &ActorId,
    ) -> Result<Option<HistoricEntry>, StorageError> {
        let entry = self
            .conn
            .query_row(
                "SELECT historic_id, entity_id, user_id, kind, date, snapshot, checksum FROM historic WHERE collection = ?1 AND entity_id = ?2 AND user_id = ?3 ORDER BY date DESC, seq DESC LIMIT 1",
                rusqlite::params![collection, id.as_bytes().as_slice(), actor.as_str()],
                |row| read_historic(row).map_err(tunnel),
            )
            .optional()?;
        Ok(entry)
    }

    fn begin(&mut self) -> Result<(), StorageError> {
        if !self.conn.is_autocommit() {
            return Err(StorageError::Transaction("transaction already open".into()));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.conn.is_autocommit() {
            return Err(StorageError::Transaction("no open transaction".into()));
        }
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        if self.conn.is_autocommit() {
            return Err(StorageError::Transaction("no open transaction".into()));
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

/// Wrapper error type used to tunnel StorageError through rusqlite's error system
/// in query_map closures that must return rusqlite::Error.
#[derive(Debug)]
struct OpaqueStorageError(String);

impl std::fmt::Display for OpaqueStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpaqueStorageError {}
