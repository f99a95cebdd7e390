//! Read public key use case and its per-credential cache

use std::path::Path;
use std::sync::Mutex;

use rsa::RsaPublicKey;
use tracing::{debug, warn};

use crate::error::TpmTlsResult;
use crate::model::KeyReference;
use crate::ports::{DeviceChannel, TpmDevice};
use crate::use_cases::KeyLocator;

/// Read the RSA public key of the referenced key
///
/// Goes through the same locate sequence as signing, so a container key is
/// loaded, read and released again.
pub fn read_public_key<D: TpmDevice>(
    device: &D,
    path: &Path,
    locator: &KeyLocator,
    reference: &KeyReference,
) -> TpmTlsResult<RsaPublicKey> {
    let mut channel = device.open(path)?;
    let mut key = locator.locate(&mut channel, reference)?;
    let handle = key.handle();
    let area = key.channel().read_public(handle)?;
    key.release()?;

    debug!(%handle, key_type = area.key_type_name(), "read public area");
    area.to_rsa_public_key()
}

/// Memoized public key, filled on the first successful read
///
/// The lock is held across the read so concurrent first callers trigger a
/// single device sequence.
#[derive(Debug, Default)]
pub struct PublicKeyCache {
    key: Mutex<Option<RsaPublicKey>>,
}

impl PublicKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached key, or the result of `read` if nothing is cached yet
    ///
    /// Failures are logged and leave the cache empty so the next call retries.
    pub fn get_or_read(&self, read: impl FnOnce() -> TpmTlsResult<RsaPublicKey>) -> Option<RsaPublicKey> {
        let mut cached = self
            .key
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(key) = cached.as_ref() {
            return Some(key.clone());
        }
        match read() {
            Ok(key) => {
                *cached = Some(key.clone());
                Some(key)
            }
            Err(e) => {
                warn!("failed to read public key: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fake_tpm::{rsa_key_area, Call, FakeTpm};
    use crate::error::{CryptoError, DeviceError, TpmTlsError};
    use crate::model::{Handle, PrimaryTemplate, PublicArea};
    use rsa::traits::PublicKeyParts;
    use rsa::BigUint;

    fn tpm_path() -> &'static Path {
        Path::new("/dev/tpmrm0")
    }

    #[test]
    fn test_read_persistent_key() {
        let handle = Handle::new(0x8100_0001);
        let tpm = FakeTpm::new(rsa_key_area()).with_persistent_key(handle);

        let key = read_public_key(
            &tpm,
            tpm_path(),
            &KeyLocator::default(),
            &KeyReference::PersistentHandle(handle),
        )
        .unwrap();

        assert_eq!(key.e(), &BigUint::from(65537u32));
        assert_eq!(key.size(), 256);
        assert_eq!(tpm.count(|c| matches!(c, Call::ReadPublic(_))), 1);
    }

    #[test]
    fn test_ecc_key_is_rejected() {
        let handle = Handle::new(0x8100_0001);
        let ecc = PublicArea::parse(&PrimaryTemplate::default().marshal()).unwrap();
        let tpm = FakeTpm::new(ecc).with_persistent_key(handle);

        let result = read_public_key(
            &tpm,
            tpm_path(),
            &KeyLocator::default(),
            &KeyReference::PersistentHandle(handle),
        );
        assert!(matches!(
            result,
            Err(TpmTlsError::Crypto(CryptoError::UnsupportedKeyType { .. }))
        ));
    }

    #[test]
    fn test_cache_reads_once() {
        let cache = PublicKeyCache::new();
        let key = read_public_key(
            &FakeTpm::new(rsa_key_area()).with_persistent_key(Handle::new(0x8100_0001)),
            tpm_path(),
            &KeyLocator::default(),
            &KeyReference::PersistentHandle(Handle::new(0x8100_0001)),
        )
        .unwrap();

        let mut reads = 0;
        for _ in 0..3 {
            let got = cache.get_or_read(|| {
                reads += 1;
                Ok(key.clone())
            });
            assert_eq!(got.as_ref(), Some(&key));
        }
        assert_eq!(reads, 1);
    }

    #[test]
    fn test_cache_retries_after_failure() {
        let cache = PublicKeyCache::new();
        let failed = cache.get_or_read(|| {
            Err(DeviceError::Command {
                operation: "TPM2_ReadPublic",
                code: 0x18B,
            }
            .into())
        });
        assert!(failed.is_none());

        let area = rsa_key_area();
        let key = area.to_rsa_public_key().unwrap();
        assert_eq!(cache.get_or_read(|| area.to_rsa_public_key()), Some(key));
    }
}
