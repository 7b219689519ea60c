use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    entity_id BLOB NOT NULL CHECK (length(entity_id) = 16),
    version INTEGER NOT NULL CHECK (version >= 1),
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    PRIMARY KEY (collection, entity_id)
);

CREATE TABLE IF NOT EXISTS historic (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    historic_id BLOB NOT NULL UNIQUE CHECK (length(historic_id) = 16),
    collection TEXT NOT NULL,
    entity_id BLOB NOT NULL CHECK (length(entity_id) = 16),
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    date TEXT NOT NULL,
    snapshot BLOB NOT NULL,
    checksum BLOB NOT NULL CHECK (length(checksum) = 32)
);
CREATE INDEX IF NOT EXISTS idx_historic_entity ON historic (collection, entity_id, date, seq);
CREATE INDEX IF NOT EXISTS idx_historic_actor ON historic (collection, entity_id, user_id, date);

CREATE TRIGGER IF NOT EXISTS historic_no_update
BEFORE UPDATE ON historic
BEGIN
    SELECT RAISE(ABORT, 'historic entries are append-only');
END;

CREATE TRIGGER IF NOT EXISTS historic_no_delete
BEFORE DELETE ON historic
BEGIN
    SELECT RAISE(ABORT, 'historic entries are append-only');
END;
";
