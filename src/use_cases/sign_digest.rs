//! Sign digest use case

use std::path::Path;

use tracing::debug;

use crate::error::{CryptoError, TpmTlsResult};
use crate::model::{KeyReference, SignatureScheme, DIGEST_LEN};
use crate::ports::{DeviceChannel, TpmDevice};
use crate::use_cases::KeyLocator;

/// Sign a SHA-256 digest with the referenced key
///
/// Opens the device, locates the key, signs and releases every handle this
/// call created before returning, on success and on failure.
///
/// # Errors
///
/// Returns errors if:
/// - `digest` is not 32 bytes (checked before the device is opened)
/// - the device cannot be opened or the key cannot be located
/// - the device refuses to sign
pub fn sign_digest<D: TpmDevice>(
    device: &D,
    path: &Path,
    locator: &KeyLocator,
    reference: &KeyReference,
    digest: &[u8],
    scheme: SignatureScheme,
) -> TpmTlsResult<Vec<u8>> {
    if digest.len() != DIGEST_LEN {
        return Err(CryptoError::InvalidDigestLength {
            expected: DIGEST_LEN,
            actual: digest.len(),
        }
        .into());
    }

    let mut channel = device.open(path)?;
    let mut key = locator.locate(&mut channel, reference)?;
    let handle = key.handle();
    let signature = key.channel().sign(handle, digest, scheme)?;
    key.release()?;

    debug!(%handle, %scheme, len = signature.len(), "signed digest");
    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fake_tpm::{rsa_key_area, Call, FakeTpm};
    use crate::error::{DeviceError, TpmTlsError};
    use crate::model::Handle;

    const DIGEST: [u8; 32] = [0x42; 32];

    fn tpm_path() -> &'static Path {
        Path::new("/dev/tpmrm0")
    }

    #[test]
    fn test_sign_with_persistent_handle() {
        let handle = Handle::new(0x8100_0001);
        let tpm = FakeTpm::new(rsa_key_area()).with_persistent_key(handle);

        let signature = sign_digest(
            &tpm,
            tpm_path(),
            &KeyLocator::default(),
            &KeyReference::PersistentHandle(handle),
            &DIGEST,
            SignatureScheme::Pkcs1v15Sha256,
        )
        .unwrap();

        assert_eq!(signature, b"fake-signature");
        assert!(tpm.calls().contains(&Call::Sign {
            handle,
            digest: DIGEST.to_vec(),
            scheme: SignatureScheme::Pkcs1v15Sha256,
        }));
        assert_eq!(tpm.calls().last(), Some(&Call::Close));
    }

    #[test]
    fn test_short_digest_never_opens_device() {
        let tpm = FakeTpm::new(rsa_key_area());
        let result = sign_digest(
            &tpm,
            tpm_path(),
            &KeyLocator::default(),
            &KeyReference::PersistentHandle(Handle::new(0x8100_0001)),
            &DIGEST[..20],
            SignatureScheme::PssSha256,
        );

        assert!(matches!(
            result,
            Err(TpmTlsError::Crypto(CryptoError::InvalidDigestLength {
                expected: 32,
                actual: 20
            }))
        ));
        assert!(tpm.calls().is_empty());
    }

    #[test]
    fn test_open_failure_names_path() {
        let tpm = FakeTpm::new(rsa_key_area());
        tpm.state().fail_open = true;

        match sign_digest(
            &tpm,
            tpm_path(),
            &KeyLocator::default(),
            &KeyReference::PersistentHandle(Handle::new(0x8100_0001)),
            &DIGEST,
            SignatureScheme::PssSha256,
        ) {
            Err(TpmTlsError::Device(DeviceError::OpenFailed { path, .. })) => {
                assert_eq!(path, tpm_path())
            }
            other => panic!("expected open failure: {other:?}"),
        }
    }
}
