//! Legacy multi-recipient format.
//!
//! A random DEK encrypts the content once; the DEK is then sealed separately
//! for every recipient under a KEK derived from that recipient's password.
//! Any one recipient password recovers the same DEK and therefore the same
//! plaintext.
//!
//! New entries are never written in this format. [`encrypt`] exists so that
//! fixtures matching what older writers produced can be built.

use std::collections::BTreeMap;

use kinlog_crypto::{
    CryptoError, CryptoProvider, CryptoResult, DerivedKey, MIN_ITERATIONS, Nonce, Opened,
    TAG_SIZE,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::stored_kdf_params;
use crate::error::EntryError;
use crate::identity::TimelineId;

/// The DEK sealed for one recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedDek {
    #[serde(with = "kinlog_crypto::encoding::b64")]
    pub wrapped_dek: Vec<u8>,
    #[serde(with = "kinlog_crypto::encoding::b64")]
    pub salt: Vec<u8>,
    #[serde(with = "kinlog_crypto::encoding::b64")]
    pub nonce: Vec<u8>,
    /// Iteration count used when this record was wrapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

impl WrappedDek {
    /// A record is usable only if none of its binary fields are empty and any
    /// stored iteration count is plausible.
    pub fn is_well_formed(&self) -> bool {
        !self.wrapped_dek.is_empty()
            && !self.salt.is_empty()
            && !self.nonce.is_empty()
            && self.iterations.is_none_or(|n| n >= MIN_ITERATIONS)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRecipientEnvelope {
    #[serde(with = "kinlog_crypto::encoding::b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "kinlog_crypto::encoding::b64")]
    pub ciphertext: Vec<u8>,
    /// Wrapped DEKs keyed by recipient id.
    pub keys: BTreeMap<String, WrappedDek>,
}

/// Plaintext recovered from a legacy entry, with the recipient key that
/// opened it.
pub struct LegacyOpened {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub recipient: String,
}

impl std::fmt::Debug for LegacyOpened {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyOpened")
            .field("recipient", &self.recipient)
            .finish_non_exhaustive()
    }
}

/// Builds a legacy entry readable by every listed recipient.
pub fn encrypt(
    provider: &dyn CryptoProvider,
    plaintext: &[u8],
    recipients: &[(TimelineId, &str)],
) -> CryptoResult<MultiRecipientEnvelope> {
    if recipients.is_empty() {
        return Err(CryptoError::Encryption("no recipients".into()));
    }
    let params = provider.kdf_params();
    let dek = provider.random_key()?;
    let nonce = provider.random_nonce()?;
    let ciphertext = provider.seal(&dek, &nonce, plaintext)?;

    let mut keys = BTreeMap::new();
    for (recipient, password) in recipients {
        let salt = provider.random_salt()?;
        let wrap_nonce = provider.random_nonce()?;
        let kek = provider.derive_key(password, salt.as_bytes(), &params)?;
        let wrapped_dek = provider.seal(&kek, &wrap_nonce, dek.as_bytes())?;
        keys.insert(
            recipient.to_string(),
            WrappedDek {
                wrapped_dek,
                salt: salt.as_bytes().to_vec(),
                nonce: wrap_nonce.as_bytes().to_vec(),
                iterations: Some(params.iterations),
            },
        );
    }

    Ok(MultiRecipientEnvelope {
        nonce: nonce.as_bytes().to_vec(),
        ciphertext,
        keys,
    })
}

/// Opens a legacy entry with a password of unknown recipient, trying every
/// wrapped DEK in turn.
pub fn decrypt(
    provider: &dyn CryptoProvider,
    envelope: &MultiRecipientEnvelope,
    password: &str,
) -> Result<LegacyOpened, EntryError> {
    try_records(provider, envelope, password, envelope.keys.iter())
}

/// Opens a legacy entry only through the record belonging to `recipient`.
///
/// A password that happens to unwrap some *other* recipient's DEK is reported
/// as a mismatch here.
pub fn decrypt_as(
    provider: &dyn CryptoProvider,
    envelope: &MultiRecipientEnvelope,
    password: &str,
    recipient: &TimelineId,
) -> Result<LegacyOpened, EntryError> {
    let records = envelope
        .keys
        .iter()
        .filter(|(id, _)| TimelineId::from_recipient_key(id).as_ref() == Some(recipient));
    try_records(provider, envelope, password, records)
}

fn try_records<'a>(
    provider: &dyn CryptoProvider,
    envelope: &MultiRecipientEnvelope,
    password: &str,
    records: impl Iterator<Item = (&'a String, &'a WrappedDek)>,
) -> Result<LegacyOpened, EntryError> {
    let content_nonce = Nonce::from_slice(&envelope.nonce)?;
    if envelope.ciphertext.len() < TAG_SIZE {
        return Err(EntryError::DataCorruption(
            "content ciphertext shorter than the authentication tag".into(),
        ));
    }

    let mut tried = 0usize;
    let mut corrupt = None;
    for (recipient, record) in records {
        tried += 1;
        match unwrap_dek(provider, record, password) {
            Ok(Some(dek)) => {
                let plaintext = open_content(provider, envelope, &content_nonce, &dek)?;
                return Ok(LegacyOpened {
                    plaintext,
                    recipient: recipient.clone(),
                });
            }
            Ok(None) => {}
            // A damaged record for one recipient must not hide the others.
            Err(err @ EntryError::DataCorruption(_)) => corrupt = Some(err),
            Err(err) => return Err(err),
        }
    }

    match corrupt {
        Some(err) if tried == 1 => Err(err),
        _ => Err(EntryError::AuthenticationMismatch),
    }
}

fn unwrap_dek(
    provider: &dyn CryptoProvider,
    record: &WrappedDek,
    password: &str,
) -> Result<Option<DerivedKey>, EntryError> {
    let nonce = Nonce::from_slice(&record.nonce)?;
    let params = stored_kdf_params(provider, record.iterations)?;
    let kek = provider.derive_key(password, &record.salt, &params)?;

    match provider.open(&kek, &nonce, &record.wrapped_dek)? {
        Opened::Plaintext(raw) => Ok(Some(DerivedKey::from_slice(&raw)?)),
        Opened::WrongKey => Ok(None),
    }
}

fn open_content(
    provider: &dyn CryptoProvider,
    envelope: &MultiRecipientEnvelope,
    nonce: &Nonce,
    dek: &DerivedKey,
) -> Result<Zeroizing<Vec<u8>>, EntryError> {
    match provider.open(dek, nonce, &envelope.ciphertext)? {
        Opened::Plaintext(plaintext) => Ok(plaintext),
        Opened::WrongKey => Err(EntryError::DataCorruption(
            "content failed to authenticate under the recovered DEK".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinlog_crypto::{KdfParams, SystemCrypto};

    fn provider() -> SystemCrypto {
        SystemCrypto::new(KdfParams::new(1_000)).unwrap()
    }

    fn family_entry(p: &SystemCrypto) -> MultiRecipientEnvelope {
        encrypt(
            p,
            b"first day of school",
            &[(TimelineId::General, "parent-pw"), (TimelineId::child(1), "kid-pw")],
        )
        .unwrap()
    }

    #[test]
    fn every_recipient_opens_same_plaintext() {
        let p = provider();
        let env = family_entry(&p);

        let by_parent = decrypt(&p, &env, "parent-pw").unwrap();
        let by_child = decrypt(&p, &env, "kid-pw").unwrap();
        assert_eq!(by_parent.plaintext.as_slice(), b"first day of school");
        assert_eq!(by_parent.plaintext.as_slice(), by_child.plaintext.as_slice());
        assert_eq!(by_parent.recipient, "general");
        assert_eq!(by_child.recipient, "child:1");
    }

    #[test]
    fn outsider_is_mismatch() {
        let p = provider();
        let env = family_entry(&p);
        assert!(decrypt(&p, &env, "stranger").unwrap_err().is_mismatch());
    }

    #[test]
    fn restricted_decrypt_ignores_other_recipients() {
        let p = provider();
        let env = family_entry(&p);
        assert!(decrypt_as(&p, &env, "kid-pw", &TimelineId::General)
            .unwrap_err()
            .is_mismatch());
        let opened = decrypt_as(&p, &env, "kid-pw", &TimelineId::child(1)).unwrap();
        assert_eq!(opened.recipient, "child:1");
    }

    #[test]
    fn legacy_key_spellings_are_matched() {
        let p = provider();
        let mut env = family_entry(&p);
        let parent = env.keys.remove("general").unwrap();
        let child = env.keys.remove("child:1").unwrap();
        env.keys.insert("parent".into(), parent);
        env.keys.insert("1".into(), child);

        assert!(decrypt_as(&p, &env, "parent-pw", &TimelineId::General).is_ok());
        assert!(decrypt_as(&p, &env, "kid-pw", &TimelineId::child(1)).is_ok());
    }

    #[test]
    fn tampered_content_after_dek_unwrap_is_corruption() {
        let p = provider();
        let mut env = family_entry(&p);
        env.ciphertext[0] ^= 0xFF;
        assert!(matches!(
            decrypt(&p, &env, "kid-pw"),
            Err(EntryError::DataCorruption(_))
        ));
    }

    #[test]
    fn damaged_record_does_not_hide_valid_one() {
        let p = provider();
        let mut env = family_entry(&p);
        env.keys.get_mut("general").unwrap().nonce.truncate(5);
        assert!(decrypt(&p, &env, "kid-pw").is_ok());
        assert!(decrypt(&p, &env, "stranger").unwrap_err().is_mismatch());
    }

    #[test]
    fn zero_iteration_record_does_not_hide_valid_one() {
        let p = provider();
        let mut env = family_entry(&p);
        // Records are tried in key order, so the damaged child record comes first.
        let child = env.keys.get_mut("child:1").unwrap();
        child.iterations = Some(0);
        assert!(!child.is_well_formed());

        let opened = decrypt(&p, &env, "parent-pw").unwrap();
        assert_eq!(opened.recipient, "general");
        assert!(decrypt(&p, &env, "stranger").unwrap_err().is_mismatch());
    }

    #[test]
    fn records_carry_iteration_count() {
        let p = provider();
        let env = family_entry(&p);
        let reader = SystemCrypto::new(KdfParams::new(5_000)).unwrap();
        assert!(decrypt(&reader, &env, "parent-pw").is_ok());
        assert!(env.keys.values().all(|r| r.iterations == Some(1_000)));
    }

    #[test]
    fn no_recipients_rejected() {
        let p = provider();
        assert!(encrypt(&p, b"x", &[]).is_err());
    }
}
