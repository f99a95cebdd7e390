use std::fs;
use std::path::Path;

use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPublicKey;

use crate::adapters::RawTpmDevice;
use crate::error::{CryptoError, DeviceError, TpmTlsResult};
use crate::use_cases::{read_public_key as read_public_key_use_case, KeyLocator};

pub use crate::adapters::{
    load_certificate_chain, CertificateBundle, LeafCertificate, PeerConfig, TlsConfig,
    TpmSigningKey, DEFAULT_TPM_PATH,
};
pub use crate::credential::{Credential, CredentialBuilder, CredentialConfig};
pub use crate::logic::{
    decode, encode, from_pem, read_tss_file, to_pem, unwrap_tpm2b, write_tss_file,
    TSS2_PEM_LABEL,
};
pub use crate::model::*;

/// Credential on the kernel TPM device named in `config`
pub fn open_credential(config: CredentialConfig) -> TpmTlsResult<Credential<RawTpmDevice>> {
    CredentialBuilder::new().build(config, RawTpmDevice)
}

/// Wrap the `.pub`/`.priv` blobs written by the TPM tooling into a container
pub fn create_tss_key(public_path: &Path, private_path: &Path, parent: Handle) -> TpmTlsResult<TssKey> {
    let read = |path: &Path| {
        fs::read(path).map_err(|source| DeviceError::KeyFile {
            path: path.to_path_buf(),
            source,
        })
    };
    let key = TssKey::from_blobs(read(public_path)?, read(private_path)?, parent);
    // Both blobs must at least be well-formed TPM2B structures
    unwrap_tpm2b(&key.public)?;
    unwrap_tpm2b(&key.private)?;
    Ok(key)
}

/// Public key of a key reference, read straight from the device
///
/// Unlike [`Credential`] nothing is purged or cached.
pub fn read_public_key(device_path: &Path, source: KeySource) -> TpmTlsResult<RsaPublicKey> {
    let reference = KeyReference::try_from(source)?;
    read_public_key_use_case(&RawTpmDevice, device_path, &KeyLocator::default(), &reference)
}

/// SubjectPublicKeyInfo PEM with LF line endings
pub fn public_key_pem(key: &RsaPublicKey) -> TpmTlsResult<String> {
    key.to_public_key_pem(LineEnding::LF).map_err(|e| {
        CryptoError::InvalidPublicKey {
            reason: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FormatError, TpmTlsError};
    use crate::logic::marshal::TpmWriter;
    use crate::model::public_area::tests::{rsa_public_bytes, test_modulus};

    #[test]
    fn test_create_tss_key_from_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let public = TpmWriter::new()
            .tpm2b(&rsa_public_bytes(&test_modulus(), 0))
            .into_bytes();
        let private = TpmWriter::new().tpm2b(&[0x33; 32]).into_bytes();
        fs::write(dir.path().join("key.pub"), &public).unwrap();
        fs::write(dir.path().join("key.priv"), &private).unwrap();

        let key = create_tss_key(
            &dir.path().join("key.pub"),
            &dir.path().join("key.priv"),
            Handle::new(0x8100_0001),
        )
        .unwrap();

        assert_eq!(key.public, public);
        assert_eq!(key.private, private);
        assert!(key.empty_auth);
        assert!(matches!(key.public_area().unwrap(), PublicArea::Rsa(_)));
    }

    #[test]
    fn test_create_tss_key_rejects_truncated_blob() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("key.pub"), [0x00, 0x02, 0xAA, 0xBB]).unwrap();
        fs::write(dir.path().join("key.priv"), [0x00, 0x08, 0x01]).unwrap();

        assert!(matches!(
            create_tss_key(
                &dir.path().join("key.pub"),
                &dir.path().join("key.priv"),
                Handle::OWNER
            ),
            Err(TpmTlsError::Format(FormatError::Tpm2b { .. }))
        ));
    }

    #[test]
    fn test_create_tss_key_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        match create_tss_key(&dir.path().join("a.pub"), &dir.path().join("a.priv"), Handle::OWNER) {
            Err(TpmTlsError::Device(DeviceError::KeyFile { path, .. })) => {
                assert!(path.ends_with("a.pub"))
            }
            other => panic!("expected key file error: {other:?}"),
        }
    }

    #[test]
    fn test_public_key_pem() {
        let key = PublicArea::parse(&rsa_public_bytes(&test_modulus(), 0))
            .unwrap()
            .to_rsa_public_key()
            .unwrap();
        let pem = public_key_pem(&key).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(!pem.contains('\r'));
    }

    #[test]
    fn test_read_public_key_needs_reference() {
        assert!(matches!(
            read_public_key(Path::new(DEFAULT_TPM_PATH), KeySource::default()),
            Err(TpmTlsError::Config(_))
        ));
    }
}
