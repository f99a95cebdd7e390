//! rustls integration: a signing key backed by a `DigestSigner` and the
//! client/server configurations that present it

use std::sync::Arc;

use rsa::pkcs8::EncodePublicKey;
use rustls::client::ResolvesClientCert;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, SubjectPublicKeyInfoDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::{CertifiedKey, Signer, SigningKey};
use rustls::{
    CipherSuite, ClientConfig, ProtocolVersion, RootCertStore, ServerConfig, SignatureAlgorithm,
    SupportedCipherSuite, SupportedProtocolVersion,
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::adapters::certificate::LeafCertificate;
use crate::error::ConfigError;
use crate::model::SignatureScheme;
use crate::ports::DigestSigner;

/// Certificate and signing capability handed to the TLS stack
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub leaf: Option<LeafCertificate>,
    /// Intermediates sent after the leaf
    pub chain: Vec<CertificateDer<'static>>,
    pub signer: Arc<dyn DigestSigner>,
}

impl CertificateBundle {
    /// Leaf followed by the chain, as sent in the Certificate message
    pub fn certificate_chain(&self) -> Vec<CertificateDer<'static>> {
        self.leaf
            .iter()
            .map(|leaf| leaf.der.clone())
            .chain(self.chain.iter().cloned())
            .collect()
    }

    fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.leaf.as_ref()?;
        let key = Arc::new(TpmSigningKey::new(Arc::clone(&self.signer)));
        Some(Arc::new(CertifiedKey::new(self.certificate_chain(), key)))
    }
}

/// Caller-supplied TLS settings the credential builds on
///
/// `certificates` and `cipher_suites` belong to the credential and must be
/// left empty.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub root_certificates: RootCertStore,
    /// Trust anchors for client certificates (server side)
    pub client_ca_certificates: Option<RootCertStore>,
    /// Reject clients without a certificate when client CAs are set
    pub require_client_auth: bool,
    pub server_name: Option<ServerName<'static>>,
    pub min_version: Option<ProtocolVersion>,
    pub max_version: Option<ProtocolVersion>,
    pub certificates: Vec<CertificateDer<'static>>,
    pub cipher_suites: Vec<CipherSuite>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            root_certificates: RootCertStore::empty(),
            client_ca_certificates: None,
            require_client_auth: true,
            server_name: None,
            min_version: None,
            max_version: None,
            certificates: Vec::new(),
            cipher_suites: Vec::new(),
        }
    }
}

/// TLS settings with the credential's certificate and key attached
#[derive(Debug, Clone)]
pub struct TlsConfig {
    provider: Arc<CryptoProvider>,
    versions: Vec<&'static SupportedProtocolVersion>,
    root_certificates: Arc<RootCertStore>,
    client_ca_certificates: Option<Arc<RootCertStore>>,
    require_client_auth: bool,
    server_name: Option<ServerName<'static>>,
    bundle: CertificateBundle,
}

impl TlsConfig {
    /// Merge a base peer configuration with the credential's bundle
    pub fn assemble(
        base: PeerConfig,
        bundle: CertificateBundle,
        cipher_suites: &[CipherSuite],
    ) -> Result<Self, ConfigError> {
        if !base.certificates.is_empty() {
            return Err(ConfigError::CertificateChainOverride);
        }
        if !base.cipher_suites.is_empty() {
            return Err(ConfigError::CipherSuiteOverride);
        }

        let versions = protocol_versions(base.min_version, base.max_version)?;
        let provider = CryptoProvider {
            cipher_suites: resolve_cipher_suites(cipher_suites)?,
            ..ring::default_provider()
        };

        Ok(Self {
            provider: Arc::new(provider),
            versions,
            root_certificates: Arc::new(base.root_certificates),
            client_ca_certificates: base.client_ca_certificates.map(Arc::new),
            require_client_auth: base.require_client_auth,
            server_name: base.server_name,
            bundle,
        })
    }

    pub fn server_name(&self) -> Option<&ServerName<'static>> {
        self.server_name.as_ref()
    }

    pub fn bundle(&self) -> &CertificateBundle {
        &self.bundle
    }

    pub fn cipher_suites(&self) -> Vec<CipherSuite> {
        self.provider.cipher_suites.iter().map(|s| s.suite()).collect()
    }

    pub fn protocol_versions(&self) -> Vec<ProtocolVersion> {
        self.versions.iter().map(|v| v.version).collect()
    }

    /// Client configuration that answers certificate requests with the bundle
    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        let resolver = BundleResolver::new(&self.bundle);
        let config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&self.versions)
            .map_err(tls_error)?
            .with_root_certificates(Arc::clone(&self.root_certificates))
            .with_client_cert_resolver(Arc::new(resolver));
        Ok(config)
    }

    /// Server configuration presenting the bundle
    ///
    /// Client certificates are verified against the client CAs when set.
    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let resolver = BundleResolver::new(&self.bundle);
        if resolver.key.is_none() {
            return Err(ConfigError::Tls {
                reason: "a server configuration needs a certificate".into(),
            });
        }

        let builder = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&self.versions)
            .map_err(tls_error)?;

        let builder = match &self.client_ca_certificates {
            Some(roots) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(
                    Arc::clone(roots),
                    Arc::clone(&self.provider),
                );
                let verifier = if self.require_client_auth {
                    verifier
                } else {
                    verifier.allow_unauthenticated()
                };
                let verifier = verifier.build().map_err(|e| ConfigError::Tls {
                    reason: e.to_string(),
                })?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        Ok(builder.with_cert_resolver(Arc::new(resolver)))
    }
}

fn tls_error(err: rustls::Error) -> ConfigError {
    ConfigError::Tls {
        reason: err.to_string(),
    }
}

/// Map configured suite identifiers onto the ring provider's suites
///
/// An empty list selects every provider suite usable with an RSA key.
pub fn resolve_cipher_suites(
    suites: &[CipherSuite],
) -> Result<Vec<SupportedCipherSuite>, ConfigError> {
    let available: Vec<SupportedCipherSuite> = ring::default_provider()
        .cipher_suites
        .into_iter()
        .filter(|s| s.usable_for_signature_algorithm(SignatureAlgorithm::RSA))
        .collect();

    if suites.is_empty() {
        return Ok(available);
    }

    suites
        .iter()
        .map(|wanted| {
            available
                .iter()
                .find(|s| s.suite() == *wanted)
                .copied()
                .ok_or_else(|| ConfigError::UnsupportedCipherSuite {
                    suite: format!("{wanted:?}"),
                })
        })
        .collect()
}

fn protocol_versions(
    min: Option<ProtocolVersion>,
    max: Option<ProtocolVersion>,
) -> Result<Vec<&'static SupportedProtocolVersion>, ConfigError> {
    let min_code = min.map_or(0, u16::from);
    let max_code = max.map_or(u16::MAX, u16::from);
    if min_code > max_code {
        return Err(ConfigError::ProtocolVersions {
            reason: format!("minimum {min:?} is above maximum {max:?}"),
        });
    }

    let versions: Vec<_> = rustls::ALL_VERSIONS
        .iter()
        .copied()
        .filter(|v| (min_code..=max_code).contains(&u16::from(v.version)))
        .collect();
    if versions.is_empty() {
        return Err(ConfigError::ProtocolVersions {
            reason: format!("no supported version between {min:?} and {max:?}"),
        });
    }
    Ok(versions)
}

/// rustls signing key whose private half lives behind a `DigestSigner`
#[derive(Debug)]
pub struct TpmSigningKey {
    signer: Arc<dyn DigestSigner>,
}

impl TpmSigningKey {
    pub fn new(signer: Arc<dyn DigestSigner>) -> Self {
        Self { signer }
    }
}

impl SigningKey for TpmSigningKey {
    fn choose_scheme(&self, offered: &[rustls::SignatureScheme]) -> Option<Box<dyn Signer>> {
        let scheme = self.signer.scheme();
        if !offered.contains(&scheme.to_rustls()) {
            debug!(%scheme, ?offered, "peer does not accept the configured scheme");
            return None;
        }
        Some(Box::new(TpmSigner {
            signer: Arc::clone(&self.signer),
            scheme,
        }))
    }

    fn public_key(&self) -> Option<SubjectPublicKeyInfoDer<'_>> {
        let key = self.signer.public_key()?;
        match key.to_public_key_der() {
            Ok(doc) => Some(SubjectPublicKeyInfoDer::from(doc.as_bytes().to_vec())),
            Err(e) => {
                warn!("failed to encode public key: {e}");
                None
            }
        }
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::RSA
    }
}

#[derive(Debug)]
struct TpmSigner {
    signer: Arc<dyn DigestSigner>,
    scheme: SignatureScheme,
}

impl Signer for TpmSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        let digest = Sha256::digest(message);
        self.signer
            .sign(&digest, self.scheme)
            .map_err(|e| rustls::Error::General(format!("TPM signing failed: {e}")))
    }

    fn scheme(&self) -> rustls::SignatureScheme {
        self.scheme.to_rustls()
    }
}

/// Presents the bundle to every peer that accepts its signature scheme
#[derive(Debug)]
struct BundleResolver {
    key: Option<Arc<CertifiedKey>>,
}

impl BundleResolver {
    fn new(bundle: &CertificateBundle) -> Self {
        Self {
            key: bundle.certified_key(),
        }
    }
}

impl ResolvesClientCert for BundleResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[rustls::SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let key = self.key.as_ref()?;
        key.key.choose_scheme(sigschemes)?;
        Some(Arc::clone(key))
    }

    fn has_certs(&self) -> bool {
        self.key.is_some()
    }
}

impl ResolvesServerCert for BundleResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let key = self.key.as_ref()?;
        key.key.choose_scheme(client_hello.signature_schemes())?;
        Some(Arc::clone(key))
    }
}
