use kinlog_timeline::StoreError;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection lock poisoned")]
    LockPoisoned,

    #[error("entry already exists: {0}")]
    Duplicate(String),
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Duplicate(id) => StoreError::Duplicate(id),
            StorageError::Serialization(e) => StoreError::Serialization(e),
            other => StoreError::Backend(other.to_string()),
        }
    }
}
