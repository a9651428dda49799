//! Child password recovery.
//!
//! A child's timeline password is sealed under a key derived from the
//! parent's password, so the parent can rehydrate every child password after
//! logging in without any password ever being stored in the clear.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::cipher::{Nonce, Opened};
use crate::error::{CryptoError, CryptoResult};
use crate::key::KdfParams;
use crate::provider::CryptoProvider;

/// A child password wrapped under the parent's password.
///
/// Every call to [`wrap_credential`] produces a wholly new record; a password
/// change replaces the previous record rather than updating it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(with = "crate::encoding::b64")]
    pub wrapped_password: Vec<u8>,
    #[serde(with = "crate::encoding::b64")]
    pub salt: Vec<u8>,
    #[serde(with = "crate::encoding::b64")]
    pub nonce: Vec<u8>,
    /// Iteration count the wrapping key was derived with. Records written
    /// before the count was recorded fall back to the provider's current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

/// Wraps `child_password` under a key derived from `parent_password`.
pub fn wrap_credential(
    provider: &dyn CryptoProvider,
    child_password: &str,
    parent_password: &str,
) -> CryptoResult<CredentialRecord> {
    if child_password.is_empty() {
        return Err(CryptoError::EmptyPassword);
    }
    let params = provider.kdf_params();
    let salt = provider.random_salt()?;
    let nonce = provider.random_nonce()?;
    let kek = provider.derive_key(parent_password, salt.as_bytes(), &params)?;
    let wrapped_password = provider.seal(&kek, &nonce, child_password.as_bytes())?;

    Ok(CredentialRecord {
        wrapped_password,
        salt: salt.as_bytes().to_vec(),
        nonce: nonce.as_bytes().to_vec(),
        iterations: Some(params.iterations),
    })
}

/// Recovers the child password from `record` using `parent_password`.
///
/// Returns [`Opened::WrongKey`] when the parent password does not match.
pub fn unwrap_credential(
    provider: &dyn CryptoProvider,
    record: &CredentialRecord,
    parent_password: &str,
) -> CryptoResult<Opened<Zeroizing<String>>> {
    let nonce = Nonce::from_slice(&record.nonce)?;
    let params = record
        .iterations
        .map(KdfParams::new)
        .unwrap_or_else(|| provider.kdf_params());
    let kek = provider.derive_key(parent_password, &record.salt, &params)?;

    match provider.open(&kek, &nonce, &record.wrapped_password)? {
        Opened::Plaintext(bytes) => {
            let text = std::str::from_utf8(&bytes)
                .map_err(|e| CryptoError::CorruptPayload(format!("wrapped password: {e}")))?;
            Ok(Opened::Plaintext(Zeroizing::new(text.to_owned())))
        }
        Opened::WrongKey => Ok(Opened::WrongKey),
    }
}
