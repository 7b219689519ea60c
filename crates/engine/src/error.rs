use lockdoc_core::CoreError;
use lockdoc_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("invalid collection config: {0}")]
    InvalidConfig(String),

    #[error("historic snapshot for {entity_id} failed: {source}")]
    Historic {
        entity_id: String,
        #[source]
        source: StorageError,
    },
}

impl EngineError {
    /// True for version conflicts; the caller may re-read and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(e) if e.is_conflict())
    }
}
