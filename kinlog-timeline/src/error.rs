//! Timeline error types.
//!
//! Two tiers: [`EntryError`] classifies a single entry and never unwinds a
//! batch; [`TimelineError`] is for failures of an operation as a whole.

use kinlog_crypto::CryptoError;
use thiserror::Error;

use crate::identity::ChildId;

/// Result type for timeline operations.
pub type TimelineResult<T> = Result<T, TimelineError>;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Why a single entry could not be opened.
#[derive(Debug, Error)]
pub enum EntryError {
    /// The password does not open this entry's key material.
    #[error("password does not open this entry")]
    AuthenticationMismatch,

    /// Authentication succeeded (or the key material is present) but the
    /// payload or its fields are structurally invalid.
    #[error("entry data is corrupt: {0}")]
    DataCorruption(String),

    /// The stored shape matches neither known format.
    #[error("unrecognized entry format: {0}")]
    UnrecognizedFormat(String),

    /// A primitive failed for reasons unrelated to the stored data.
    #[error("crypto failure: {0}")]
    Fault(#[source] CryptoError),
}

impl EntryError {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::AuthenticationMismatch)
    }
}

impl From<CryptoError> for EntryError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidNonceLength { .. }
            | CryptoError::InvalidKeyLength { .. }
            | CryptoError::SaltTooShort { .. }
            | CryptoError::CorruptPayload(_) => Self::DataCorruption(err.to_string()),
            other => Self::Fault(other),
        }
    }
}

/// Errors surfaced by a record store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry already exists: {0}")]
    Duplicate(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that abort a timeline operation.
#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("child not found: {0}")]
    ChildNotFound(ChildId),

    #[error("parent password does not match")]
    ParentPasswordMismatch,

    #[error("entry {id}: {source}")]
    Entry {
        id: String,
        #[source]
        source: EntryError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(String),
}
