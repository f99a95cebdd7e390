//! TPM-backed TLS credential
//!
//! A [`Credential`] ties a key reference to a device and a certificate. It
//! signs through the TPM under a per-credential lock and hands rustls a
//! [`CertificateBundle`] whose key never leaves the device.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rsa::RsaPublicKey;
use rustls::pki_types::CertificateDer;
use rustls::CipherSuite;
use tracing::{debug, info};

use crate::adapters::{
    load_certificate_chain, resolve_cipher_suites, CertificateBundle, LeafCertificate,
    PeerConfig, TlsConfig, DEFAULT_TPM_PATH,
};
use crate::error::{ConfigError, CryptoError, TpmTlsResult};
use crate::model::{KeyReference, KeySource, SignatureScheme};
use crate::ports::{DigestSigner, TpmDevice};
use crate::use_cases::{read_public_key, sign_digest, KeyLocator, PublicKeyCache};

/// Configuration for building a credential
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub device_path: PathBuf,
    pub key: KeySource,
    pub scheme: SignatureScheme,
    /// Leaf certificate (PEM or DER), optionally followed by intermediates
    pub certificate_path: Option<PathBuf>,
    /// Empty selects every suite usable with an RSA key
    pub cipher_suites: Vec<CipherSuite>,
    /// Flush stale sessions and transient objects when the credential is built
    pub purge_on_start: bool,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_TPM_PATH),
            key: KeySource::default(),
            scheme: SignatureScheme::default(),
            certificate_path: None,
            cipher_suites: Vec::new(),
            purge_on_start: true,
        }
    }
}

/// Validates a [`CredentialConfig`] and prepares the device
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialBuilder;

impl CredentialBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a credential on `device`
    ///
    /// Every configuration check runs before the device is opened. The purge,
    /// if enabled, is the last step.
    ///
    /// # Errors
    ///
    /// Returns errors if:
    /// - the key source sets no reference or more than one
    /// - a configured cipher suite is not supported
    /// - the certificate cannot be read or parsed
    /// - the purge fails
    pub fn build<D: TpmDevice>(
        &self,
        config: CredentialConfig,
        device: D,
    ) -> TpmTlsResult<Credential<D>> {
        let reference = KeyReference::try_from(config.key)?;
        resolve_cipher_suites(&config.cipher_suites)?;
        let (leaf, chain) = match &config.certificate_path {
            Some(path) => {
                let (leaf, chain) = load_certificate_chain(path)?;
                (Some(leaf), chain)
            }
            None => (None, Vec::new()),
        };

        let locator = KeyLocator::default();
        if config.purge_on_start {
            let mut channel = device.open(&config.device_path)?;
            locator.purge(&mut channel)?;
        }

        info!(
            key = %reference.describe(),
            scheme = %config.scheme,
            device = %config.device_path.display(),
            "credential ready"
        );
        Ok(Credential {
            inner: Arc::new(Inner {
                device,
                device_path: config.device_path,
                reference,
                scheme: config.scheme,
                locator,
                leaf,
                chain,
                cipher_suites: config.cipher_suites,
                lock: Mutex::new(()),
                public_key: PublicKeyCache::new(),
            }),
        })
    }
}

/// Signing credential whose private key stays in the TPM
///
/// Clones share the device lock and the public key cache.
pub struct Credential<D: TpmDevice> {
    inner: Arc<Inner<D>>,
}

#[derive(Debug)]
struct Inner<D: TpmDevice> {
    device: D,
    device_path: PathBuf,
    reference: KeyReference,
    scheme: SignatureScheme,
    locator: KeyLocator,
    leaf: Option<LeafCertificate>,
    chain: Vec<CertificateDer<'static>>,
    cipher_suites: Vec<CipherSuite>,
    /// Held for the whole open-locate-use-release sequence
    lock: Mutex<()>,
    public_key: PublicKeyCache,
}

impl<D: TpmDevice> Clone for Credential<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: TpmDevice> fmt::Debug for Credential<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("key", &self.inner.reference.describe())
            .field("scheme", &self.inner.scheme)
            .field("device_path", &self.inner.device_path)
            .finish_non_exhaustive()
    }
}

impl<D: TpmDevice> Credential<D> {
    pub fn reference(&self) -> &KeyReference {
        &self.inner.reference
    }

    pub fn leaf_certificate(&self) -> Option<&LeafCertificate> {
        self.inner.leaf.as_ref()
    }

    fn exclusive<T>(&self, operation: impl FnOnce(&Inner<D>) -> TpmTlsResult<T>) -> TpmTlsResult<T> {
        let _guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        operation(&self.inner)
    }
}

impl<D: TpmDevice + 'static> Credential<D> {
    /// Certificate, chain and a signer backed by this credential
    pub fn certificate_bundle(&self) -> CertificateBundle {
        CertificateBundle {
            leaf: self.inner.leaf.clone(),
            chain: self.inner.chain.clone(),
            signer: Arc::new(self.clone()),
        }
    }

    /// TLS configuration built on `base`
    ///
    /// Does not touch the device.
    pub fn tls_config(&self, base: PeerConfig) -> Result<TlsConfig, ConfigError> {
        TlsConfig::assemble(base, self.certificate_bundle(), &self.inner.cipher_suites)
    }
}

impl<D: TpmDevice> DigestSigner for Credential<D> {
    fn public_key(&self) -> Option<RsaPublicKey> {
        self.inner.public_key.get_or_read(|| {
            self.exclusive(|inner| {
                read_public_key(
                    &inner.device,
                    &inner.device_path,
                    &inner.locator,
                    &inner.reference,
                )
            })
        })
    }

    fn sign(&self, digest: &[u8], scheme: SignatureScheme) -> TpmTlsResult<Vec<u8>> {
        if scheme != self.inner.scheme {
            return Err(CryptoError::SchemeMismatch {
                configured: self.inner.scheme.name(),
                requested: scheme.name(),
            }
            .into());
        }
        debug!(%scheme, "signing digest");
        self.exclusive(|inner| {
            sign_digest(
                &inner.device,
                &inner.device_path,
                &inner.locator,
                &inner.reference,
                digest,
                scheme,
            )
        })
    }

    fn scheme(&self) -> SignatureScheme {
        self.inner.scheme
    }
}
