//! Password-based key derivation.
//!
//! PBKDF2-HMAC-SHA256 with a 16-byte random salt and a 32-byte output. The
//! iteration count travels with [`KdfParams`] so that material wrapped under
//! an older count keeps deriving the same key after the default is raised.

use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// Size of a symmetric key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a freshly generated salt in bytes. Also the minimum accepted.
pub const SALT_SIZE: usize = 16;

/// Iteration count for newly derived keys.
pub const DEFAULT_ITERATIONS: u32 = 600_000;

/// Lowest iteration count [`KdfParams`] can be configured with.
pub const MIN_ITERATIONS: u32 = 1_000;

/// Key derivation parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub iterations: u32,
}

impl KdfParams {
    pub const fn new(iterations: u32) -> Self {
        Self { iterations }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::new(DEFAULT_ITERATIONS)
    }
}

/// Random salt mixed into every derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Generates a fresh salt from the OS RNG.
    pub fn random() -> CryptoResult<Self> {
        let mut bytes = [0u8; SALT_SIZE];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::Random(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

/// 256-bit symmetric key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a slice, rejecting anything that is not [`KEY_SIZE`] long.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

/// Derives a key from `password` and `salt`.
///
/// Deterministic for the same password, salt and iteration count. The salt is
/// accepted as a slice because legacy records store it as raw bytes of
/// whatever length they were written with; anything shorter than
/// [`SALT_SIZE`] is refused.
pub fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> CryptoResult<DerivedKey> {
    if password.is_empty() {
        return Err(CryptoError::EmptyPassword);
    }
    if salt.len() < SALT_SIZE {
        return Err(CryptoError::SaltTooShort {
            min: SALT_SIZE,
            actual: salt.len(),
        });
    }
    if params.iterations == 0 {
        return Err(CryptoError::KeyDerivation("iteration count must be non-zero".into()));
    }

    let mut out = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, params.iterations, &mut out);
    let key = DerivedKey(out);
    out.zeroize();
    Ok(key)
}

/// Generates a random key (used as a per-entry DEK in the legacy format).
pub fn generate_random_key() -> CryptoResult<DerivedKey> {
    let mut bytes = [0u8; KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::Random(e.to_string()))?;
    let key = DerivedKey(bytes);
    bytes.zeroize();
    Ok(key)
}
