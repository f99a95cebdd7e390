//! Adapters - concrete implementations of ports (traits)

mod certificate;
mod raw_tpm;
mod rustls_tls;

#[cfg(test)]
pub mod fake_tpm;

pub use certificate::{load_certificate_chain, LeafCertificate};
pub use raw_tpm::{RawTpmChannel, RawTpmDevice, DEFAULT_TPM_PATH};
pub use rustls_tls::{
    resolve_cipher_suites, CertificateBundle, PeerConfig, TlsConfig, TpmSigningKey,
};
