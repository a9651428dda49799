//! ChaCha20-Poly1305 sealing and opening.
//!
//! The nonce is supplied by the caller and stored next to the ciphertext.
//! Callers must draw a fresh nonce for every `seal` under the same key.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::TryRngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;

/// ChaCha20-Poly1305 nonce size.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Per-call cipher nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    pub fn random() -> CryptoResult<Self> {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::Random(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parses a stored nonce. A wrong length is a hard error, not a wrong key.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; NONCE_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// Outcome of opening a sealed payload.
#[derive(Debug)]
pub enum Opened<T> {
    /// The tag verified and the plaintext was recovered.
    Plaintext(T),
    /// The tag did not verify: wrong key or tampered bytes.
    WrongKey,
}

impl<T> Opened<T> {
    pub fn is_wrong_key(&self) -> bool {
        matches!(self, Self::WrongKey)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Opened<U> {
        match self {
            Self::Plaintext(v) => Opened::Plaintext(f(v)),
            Self::WrongKey => Opened::WrongKey,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Plaintext(v) => Some(v),
            Self::WrongKey => None,
        }
    }
}

/// Encrypts `plaintext` under `key`, returning ciphertext with the tag appended.
pub fn seal(key: &DerivedKey, nonce: &Nonce, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(chacha20poly1305::Nonce::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))
}

/// Decrypts and authenticates `ciphertext`.
///
/// Authentication failure yields [`Opened::WrongKey`]; truncated input shorter
/// than a tag is treated the same way since it can never verify.
pub fn open(
    key: &DerivedKey,
    nonce: &Nonce,
    ciphertext: &[u8],
) -> CryptoResult<Opened<Zeroizing<Vec<u8>>>> {
    let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_bytes()));
    match cipher.decrypt(chacha20poly1305::Nonce::from_slice(nonce.as_bytes()), ciphertext) {
        Ok(plaintext) => Ok(Opened::Plaintext(Zeroizing::new(plaintext))),
        Err(_) => Ok(Opened::WrongKey),
    }
}
