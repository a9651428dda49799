//! Current entry format: content sealed directly under a key derived from the
//! timeline password.
//!
//! Each stored record targets exactly one timeline and carries the iteration
//! count it was sealed with, so raising the configured count never strands
//! older entries.

use kinlog_crypto::{CryptoProvider, CryptoResult, Nonce, Opened, TAG_SIZE};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::stored_kdf_params;
use crate::error::EntryError;

/// Format tag written into every current-format entry.
pub const FORMAT_TAG: &str = "single-timeline/v2";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleTimelineEnvelope {
    pub format: String,
    #[serde(with = "kinlog_crypto::encoding::b64")]
    pub salt: Vec<u8>,
    #[serde(with = "kinlog_crypto::encoding::b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "kinlog_crypto::encoding::b64")]
    pub ciphertext: Vec<u8>,
    /// Iteration count used to derive the sealing key. Absent on entries
    /// written before counts were recorded; those use the provider's count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

/// Seals `plaintext` for a timeline. Salt and nonce are fresh on every call.
pub fn encrypt(
    provider: &dyn CryptoProvider,
    password: &str,
    plaintext: &[u8],
) -> CryptoResult<SingleTimelineEnvelope> {
    let salt = provider.random_salt()?;
    let nonce = provider.random_nonce()?;
    let params = provider.kdf_params();
    let key = provider.derive_key(password, salt.as_bytes(), &params)?;
    let ciphertext = provider.seal(&key, &nonce, plaintext)?;

    Ok(SingleTimelineEnvelope {
        format: FORMAT_TAG.to_string(),
        salt: salt.as_bytes().to_vec(),
        nonce: nonce.as_bytes().to_vec(),
        ciphertext,
        iterations: Some(params.iterations),
    })
}

/// Opens a current-format envelope with `password`.
pub fn decrypt(
    provider: &dyn CryptoProvider,
    envelope: &SingleTimelineEnvelope,
    password: &str,
) -> Result<Zeroizing<Vec<u8>>, EntryError> {
    // Structural checks first: they are cheap and the derivation is not.
    let nonce = Nonce::from_slice(&envelope.nonce)?;
    if envelope.ciphertext.len() < TAG_SIZE {
        return Err(EntryError::DataCorruption(format!(
            "ciphertext is {} bytes, shorter than the authentication tag",
            envelope.ciphertext.len()
        )));
    }

    let params = stored_kdf_params(provider, envelope.iterations)?;
    let key = provider.derive_key(password, &envelope.salt, &params)?;
    match provider.open(&key, &nonce, &envelope.ciphertext)? {
        Opened::Plaintext(plaintext) => Ok(plaintext),
        Opened::WrongKey => Err(EntryError::AuthenticationMismatch),
    }
}
