//! Injectable crypto capability.
//!
//! Everything above the primitives takes a `&dyn CryptoProvider` rather than
//! calling the free functions directly, so tests can substitute providers and
//! the engine never reaches for ambient state.

use rand::TryRngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::cipher::{self, Nonce, Opened, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{self, DerivedKey, KdfParams, Salt, KEY_SIZE, MIN_ITERATIONS, SALT_SIZE};

/// Key derivation, authenticated encryption and randomness.
pub trait CryptoProvider: Send + Sync {
    /// Parameters used for newly derived keys.
    fn kdf_params(&self) -> KdfParams;

    /// Fills `buf` with cryptographically secure random bytes.
    fn fill_random(&self, buf: &mut [u8]) -> CryptoResult<()>;

    fn derive_key(&self, password: &str, salt: &[u8], params: &KdfParams)
    -> CryptoResult<DerivedKey>;

    fn seal(&self, key: &DerivedKey, nonce: &Nonce, plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    fn open(
        &self,
        key: &DerivedKey,
        nonce: &Nonce,
        ciphertext: &[u8],
    ) -> CryptoResult<Opened<Zeroizing<Vec<u8>>>>;

    fn random_salt(&self) -> CryptoResult<Salt> {
        let mut bytes = [0u8; SALT_SIZE];
        self.fill_random(&mut bytes)?;
        Ok(Salt::from_bytes(bytes))
    }

    fn random_nonce(&self) -> CryptoResult<Nonce> {
        let mut bytes = [0u8; NONCE_SIZE];
        self.fill_random(&mut bytes)?;
        Ok(Nonce::from_bytes(bytes))
    }

    fn random_key(&self) -> CryptoResult<DerivedKey> {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        self.fill_random(&mut bytes[..])?;
        Ok(DerivedKey::from_bytes(*bytes))
    }
}

/// Provider backed by the OS RNG, PBKDF2-HMAC-SHA256 and ChaCha20-Poly1305.
#[derive(Clone, Debug)]
pub struct SystemCrypto {
    params: KdfParams,
}

impl SystemCrypto {
    /// Creates the provider and verifies the primitives actually work.
    ///
    /// Fails with [`CryptoError::PrimitiveUnavailable`] when the RNG cannot be
    /// read or a round trip through the cipher does not behave. Callers should
    /// treat that as fatal at startup.
    pub fn new(params: KdfParams) -> CryptoResult<Self> {
        if params.iterations < MIN_ITERATIONS {
            return Err(CryptoError::KeyDerivation(format!(
                "iteration count {} below minimum {MIN_ITERATIONS}",
                params.iterations
            )));
        }
        let provider = Self { params };
        provider.self_check()?;
        Ok(provider)
    }

    fn self_check(&self) -> CryptoResult<()> {
        let unavailable = |what: &str| CryptoError::PrimitiveUnavailable(what.to_string());

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        self.fill_random(&mut a).map_err(|e| unavailable(&e.to_string()))?;
        self.fill_random(&mut b).map_err(|e| unavailable(&e.to_string()))?;
        if a == b {
            return Err(unavailable("RNG returned identical blocks"));
        }

        let probe = KdfParams::new(MIN_ITERATIONS);
        let salt = [0x5au8; SALT_SIZE];
        let k1 = key::derive_key("self-check", &salt, &probe)
            .map_err(|e| unavailable(&e.to_string()))?;
        let k2 = key::derive_key("self-check", &salt, &probe)
            .map_err(|e| unavailable(&e.to_string()))?;
        if k1.as_bytes() != k2.as_bytes() {
            return Err(unavailable("key derivation is not deterministic"));
        }

        let nonce = Nonce::from_bytes([0u8; NONCE_SIZE]);
        let sealed =
            cipher::seal(&k1, &nonce, b"kinlog").map_err(|e| unavailable(&e.to_string()))?;
        match cipher::open(&k1, &nonce, &sealed).map_err(|e| unavailable(&e.to_string()))? {
            Opened::Plaintext(pt) if pt.as_slice() == b"kinlog" => {}
            _ => return Err(unavailable("cipher round trip failed")),
        }

        let mut tampered = sealed;
        tampered[0] ^= 0x01;
        if !cipher::open(&k1, &nonce, &tampered)
            .map_err(|e| unavailable(&e.to_string()))?
            .is_wrong_key()
        {
            return Err(unavailable("cipher accepted tampered ciphertext"));
        }
        Ok(())
    }
}

impl CryptoProvider for SystemCrypto {
    fn kdf_params(&self) -> KdfParams {
        self.params
    }

    fn fill_random(&self, buf: &mut [u8]) -> CryptoResult<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| CryptoError::Random(e.to_string()))
    }

    fn derive_key(
        &self,
        password: &str,
        salt: &[u8],
        params: &KdfParams,
    ) -> CryptoResult<DerivedKey> {
        key::derive_key(password, salt, params)
    }

    fn seal(&self, key: &DerivedKey, nonce: &Nonce, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        cipher::seal(key, nonce, plaintext)
    }

    fn open(
        &self,
        key: &DerivedKey,
        nonce: &Nonce,
        ciphertext: &[u8],
    ) -> CryptoResult<Opened<Zeroizing<Vec<u8>>>> {
        cipher::open(key, nonce, ciphertext)
    }
}
