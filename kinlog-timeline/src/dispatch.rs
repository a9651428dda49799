//! Format classification and routing.
//!
//! [`classify`] is the single place that looks at the raw stored shape of an
//! entry. Everything else works with the [`EntryFormat`] it produces.

use std::collections::BTreeMap;
use std::fmt;

use kinlog_crypto::CryptoProvider;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use zeroize::Zeroizing;

use crate::codec::{self, MultiRecipientEnvelope, SingleTimelineEnvelope, WrappedDek, FORMAT_TAG};
use crate::entry::EntryRecord;
use crate::error::EntryError;
use crate::identity::TimelineId;

/// Result of classifying a stored entry body.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryFormat {
    SingleTimeline(SingleTimelineEnvelope),
    MultiRecipient(MultiRecipientEnvelope),
    Unrecognized(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FormatKind {
    SingleTimeline,
    MultiRecipient,
}

impl EntryFormat {
    pub fn kind(&self) -> Option<FormatKind> {
        match self {
            Self::SingleTimeline(_) => Some(FormatKind::SingleTimeline),
            Self::MultiRecipient(_) => Some(FormatKind::MultiRecipient),
            Self::Unrecognized(_) => None,
        }
    }
}

/// Classifies a stored entry body without attempting any decryption.
///
/// Missing, mistyped or undecodable fields always produce
/// [`EntryFormat::Unrecognized`].
pub fn classify(sealed: &Value) -> EntryFormat {
    let Some(obj) = sealed.as_object() else {
        return EntryFormat::Unrecognized("entry body is not an object".into());
    };

    if obj.contains_key("salt") {
        match obj.get("format").and_then(Value::as_str) {
            Some(FORMAT_TAG) => {
                return match serde_json::from_value::<SingleTimelineEnvelope>(sealed.clone()) {
                    Ok(envelope) => EntryFormat::SingleTimeline(envelope),
                    Err(e) => {
                        EntryFormat::Unrecognized(format!("invalid single-timeline fields: {e}"))
                    }
                };
            }
            Some(other) => {
                return EntryFormat::Unrecognized(format!("unknown format tag {other:?}"));
            }
            // A salt without a tag may still be a legacy body; fall through.
            None => {}
        }
    }

    if let Some(keys) = obj.get("keys").and_then(Value::as_object) {
        return classify_multi(obj, keys);
    }

    EntryFormat::Unrecognized("no single-timeline salt and no recipient key map".into())
}

fn classify_multi(obj: &Map<String, Value>, keys: &Map<String, Value>) -> EntryFormat {
    let (Some(nonce), Some(ciphertext)) = (b64_field(obj, "nonce"), b64_field(obj, "ciphertext"))
    else {
        return EntryFormat::Unrecognized("recipient key map without content nonce/ciphertext".into());
    };

    let valid: BTreeMap<String, WrappedDek> = keys
        .iter()
        .filter_map(|(id, raw)| {
            serde_json::from_value::<WrappedDek>(raw.clone())
                .ok()
                .filter(WrappedDek::is_well_formed)
                .map(|record| (id.clone(), record))
        })
        .collect();

    if valid.is_empty() {
        return EntryFormat::Unrecognized("no valid recipient key records".into());
    }

    EntryFormat::MultiRecipient(MultiRecipientEnvelope {
        nonce,
        ciphertext,
        keys: valid,
    })
}

fn b64_field(obj: &Map<String, Value>, name: &str) -> Option<Vec<u8>> {
    obj.get(name)
        .and_then(Value::as_str)
        .and_then(|s| kinlog_crypto::encoding::decode(s).ok())
}

/// A decrypted entry.
pub struct OpenedEntry {
    pub id: String,
    pub timestamp: i64,
    pub targets: Vec<TimelineId>,
    pub format: FormatKind,
    /// Recipient key that opened a legacy entry; `None` for current format.
    pub unlocked_by: Option<String>,
    plaintext: Zeroizing<Vec<u8>>,
}

impl OpenedEntry {
    pub fn plaintext(&self) -> &[u8] {
        &self.plaintext
    }

    /// Deserializes the plaintext as JSON content.
    ///
    /// The bytes already authenticated, so a parse failure means the stored
    /// payload is damaged rather than the password being wrong.
    pub fn content<T: DeserializeOwned>(&self) -> Result<T, EntryError> {
        serde_json::from_slice(&self.plaintext)
            .map_err(|e| EntryError::DataCorruption(format!("content does not deserialize: {e}")))
    }
}

impl fmt::Debug for OpenedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedEntry")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("targets", &self.targets)
            .field("format", &self.format)
            .field("unlocked_by", &self.unlocked_by)
            .field("plaintext_len", &self.plaintext.len())
            .finish()
    }
}

/// Opens `record` with `password`, trying any legacy recipient key.
pub fn open_entry(
    provider: &dyn CryptoProvider,
    record: &EntryRecord,
    password: &str,
) -> Result<OpenedEntry, EntryError> {
    open_with(provider, record, password, None)
}

/// Opens `record` with `password` as a member of `timeline`.
///
/// Legacy entries are only tried through `timeline`'s own wrapped DEK, so a
/// shared entry cannot attribute one recipient's password to another.
pub fn open_entry_as(
    provider: &dyn CryptoProvider,
    record: &EntryRecord,
    password: &str,
    timeline: &TimelineId,
) -> Result<OpenedEntry, EntryError> {
    open_with(provider, record, password, Some(timeline))
}

fn open_with(
    provider: &dyn CryptoProvider,
    record: &EntryRecord,
    password: &str,
    timeline: Option<&TimelineId>,
) -> Result<OpenedEntry, EntryError> {
    let (format, unlocked_by, plaintext) = match classify(&record.sealed) {
        EntryFormat::SingleTimeline(envelope) => {
            let plaintext = codec::single::decrypt(provider, &envelope, password)?;
            (FormatKind::SingleTimeline, None, plaintext)
        }
        EntryFormat::MultiRecipient(envelope) => {
            let opened = match timeline {
                Some(t) => codec::multi::decrypt_as(provider, &envelope, password, t)?,
                None => codec::multi::decrypt(provider, &envelope, password)?,
            };
            (FormatKind::MultiRecipient, Some(opened.recipient), opened.plaintext)
        }
        EntryFormat::Unrecognized(reason) => return Err(EntryError::UnrecognizedFormat(reason)),
    };

    Ok(OpenedEntry {
        id: record.id.clone(),
        timestamp: record.timestamp,
        targets: record.targets.clone(),
        format,
        unlocked_by,
        plaintext,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_object_is_unrecognized() {
        assert!(matches!(classify(&json!("blob")), EntryFormat::Unrecognized(_)));
        assert!(matches!(classify(&json!(null)), EntryFormat::Unrecognized(_)));
    }

    #[test]
    fn empty_object_is_unrecognized() {
        assert!(matches!(classify(&json!({})), EntryFormat::Unrecognized(_)));
    }

    #[test]
    fn salt_without_tag_or_keys_is_unrecognized() {
        // Intermediate writers produced this shape; it is deliberately unsupported.
        let body = json!({ "salt": "AAAA", "nonce": "AAAA", "ciphertext": "AAAA" });
        assert!(matches!(classify(&body), EntryFormat::Unrecognized(_)));
    }

    #[test]
    fn unknown_tag_is_unrecognized() {
        let body = json!({ "format": "single-timeline/v9", "salt": "AAAA", "nonce": "AAAA", "ciphertext": "AAAA" });
        assert!(matches!(classify(&body), EntryFormat::Unrecognized(_)));
    }

    #[test]
    fn tagged_body_missing_nonce_is_unrecognized() {
        let body = json!({ "format": FORMAT_TAG, "salt": "AAAA", "ciphertext": "AAAA" });
        assert!(matches!(classify(&body), EntryFormat::Unrecognized(_)));
    }

    #[test]
    fn tagged_body_with_bad_base64_is_unrecognized() {
        let body = json!({ "format": FORMAT_TAG, "salt": "%%%", "nonce": "AAAA", "ciphertext": "AAAA" });
        assert!(matches!(classify(&body), EntryFormat::Unrecognized(_)));
    }

    #[test]
    fn tagged_body_is_single_timeline() {
        let body = json!({ "format": FORMAT_TAG, "salt": "AAAA", "nonce": "AAAA", "ciphertext": "AAAA" });
        assert_eq!(classify(&body).kind(), Some(FormatKind::SingleTimeline));
    }

    #[test]
    fn key_map_with_only_empty_records_is_unrecognized() {
        let body = json!({
            "nonce": "AAAA", "ciphertext": "AAAA",
            "keys": { "general": { "wrapped_dek": "", "salt": "AAAA", "nonce": "AAAA" } }
        });
        assert!(matches!(classify(&body), EntryFormat::Unrecognized(_)));
    }

    #[test]
    fn invalid_records_are_dropped() {
        let body = json!({
            "nonce": "AAAA", "ciphertext": "AAAA",
            "keys": {
                "general": { "wrapped_dek": "AAAA", "salt": "AAAA", "nonce": "AAAA", "iterations": 1000 },
                "child:1": { "wrapped_dek": "AAAA" },
                "child:2": "garbage"
            }
        });
        match classify(&body) {
            EntryFormat::MultiRecipient(env) => {
                assert_eq!(env.keys.keys().collect::<Vec<_>>(), vec!["general"]);
            }
            other => panic!("expected multi-recipient, got {other:?}"),
        }
    }

    #[test]
    fn key_map_without_content_is_unrecognized() {
        let body = json!({
            "keys": { "general": { "wrapped_dek": "AAAA", "salt": "AAAA", "nonce": "AAAA" } }
        });
        assert!(matches!(classify(&body), EntryFormat::Unrecognized(_)));
    }
}
