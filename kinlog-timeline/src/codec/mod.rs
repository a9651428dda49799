//! Entry codecs, one per on-disk format.

pub mod multi;
pub mod single;

use kinlog_crypto::{CryptoProvider, KdfParams, MIN_ITERATIONS};

use crate::error::EntryError;

pub use multi::{LegacyOpened, MultiRecipientEnvelope, WrappedDek};
pub use single::{SingleTimelineEnvelope, FORMAT_TAG};

/// KDF parameters for opening a stored record.
///
/// A stored count always wins over the provider's. Records written before
/// counts were stored fall back to the provider. A stored count below the
/// floor can only come from damage, so it is corruption rather than a fault.
pub(crate) fn stored_kdf_params(
    provider: &dyn CryptoProvider,
    stored: Option<u32>,
) -> Result<KdfParams, EntryError> {
    match stored {
        Some(iterations) if iterations < MIN_ITERATIONS => Err(EntryError::DataCorruption(
            format!("stored iteration count {iterations} below minimum {MIN_ITERATIONS}"),
        )),
        Some(iterations) => Ok(KdfParams::new(iterations)),
        None => Ok(provider.kdf_params()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinlog_crypto::SystemCrypto;

    #[test]
    fn stored_count_wins_over_provider() {
        let p = SystemCrypto::new(KdfParams::new(1_000)).unwrap();
        assert_eq!(stored_kdf_params(&p, Some(4_000)).unwrap(), KdfParams::new(4_000));
        assert_eq!(stored_kdf_params(&p, None).unwrap(), KdfParams::new(1_000));
    }

    #[test]
    fn implausible_stored_count_is_corruption() {
        let p = SystemCrypto::new(KdfParams::new(1_000)).unwrap();
        assert!(matches!(
            stored_kdf_params(&p, Some(0)),
            Err(EntryError::DataCorruption(_))
        ));
    }
}
