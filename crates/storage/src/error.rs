use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict on {entity_id}: expected {expected}, found {actual:?}")]
    Conflict {
        entity_id: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("entity collision: {entity_id}")]
    EntityCollision { entity_id: String },

    #[error("transaction state: {0}")]
    Transaction(String),

    #[error("core error: {0}")]
    Core(#[from] lockdoc_core::CoreError),
}

impl StorageError {
    /// A conflicting concurrent write; the caller may re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }
}
