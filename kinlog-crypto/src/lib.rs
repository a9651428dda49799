//! Encryption layer for Kinlog.
//!
//! Provides the primitives the timeline engine is built on:
//! - PBKDF2-HMAC-SHA256 for key derivation from passwords
//! - ChaCha20-Poly1305 for authenticated encryption
//! - Credential wrapping so a parent can recover child passwords
//! - Secure key management with zeroization
//!
//! # Architecture
//!
//! Nothing in this crate holds state. Higher layers receive a
//! [`CryptoProvider`] and call through it, which keeps the primitives
//! swappable and makes the "primitives unavailable" condition a single
//! startup check ([`SystemCrypto::new`]).
//!
//! Opening a payload under the wrong key is an expected outcome, not an
//! error: [`open`] returns [`Opened::WrongKey`] so callers can keep trying
//! other passwords.

mod cipher;
pub mod credential;
pub mod encoding;
mod error;
mod key;
pub mod provider;

pub use cipher::{open, seal, Nonce, Opened, NONCE_SIZE, TAG_SIZE};
pub use credential::{unwrap_credential, wrap_credential, CredentialRecord};
pub use error::{CryptoError, CryptoResult};
pub use key::{
    derive_key, generate_random_key, DerivedKey, KdfParams, Salt, DEFAULT_ITERATIONS, KEY_SIZE,
    MIN_ITERATIONS, SALT_SIZE,
};
pub use provider::{CryptoProvider, SystemCrypto};
