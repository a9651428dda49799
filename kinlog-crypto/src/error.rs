//! Crypto error types.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised by the primitives.
///
/// A wrong key is deliberately *not* an error here: [`crate::open`] reports it
/// as [`crate::Opened::WrongKey`] so callers can keep probing.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("salt too short: need at least {min} bytes, got {actual}")]
    SaltTooShort { min: usize, actual: usize },

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("random number generator failed: {0}")]
    Random(String),

    #[error("authenticated payload is corrupt: {0}")]
    CorruptPayload(String),

    #[error("cryptographic primitives unavailable: {0}")]
    PrimitiveUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
