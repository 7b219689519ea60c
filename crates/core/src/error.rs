use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("invalid field path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("array at {path} has elements without a usable identity field {field:?}")]
    UnknownArrayIdentity { path: String, field: String },

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl CoreError {
    pub(crate) fn invalid_key(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
