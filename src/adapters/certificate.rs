//! Leaf certificate loading (PEM or DER X.509)

use std::fs;
use std::path::Path;

use rustls::pki_types::CertificateDer;
use tracing::info;

use crate::error::ConfigError;

const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// Parsed metadata of the certificate presented to peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    pub der: CertificateDer<'static>,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: String,
    pub not_after: String,
}

impl LeafCertificate {
    pub fn from_der(der: CertificateDer<'static>) -> Result<Self, String> {
        let (_, cert) = x509_parser::parse_x509_certificate(&der).map_err(|e| e.to_string())?;
        let validity = cert.validity();
        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            not_before: validity.not_before.to_string(),
            not_after: validity.not_after.to_string(),
            der: der.clone(),
        })
    }
}

/// Read a leaf certificate and any intermediates that follow it
///
/// PEM files may hold several `CERTIFICATE` blocks, the first is the leaf.
/// Anything else is treated as a single DER certificate.
pub fn load_certificate_chain(
    path: &Path,
) -> Result<(LeafCertificate, Vec<CertificateDer<'static>>), ConfigError> {
    let failed = |reason: String| ConfigError::Certificate {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = fs::read(path).map_err(|e| failed(e.to_string()))?;

    let mut ders: Vec<CertificateDer<'static>> = if bytes.starts_with(b"-----BEGIN") {
        pem::parse_many(&bytes)
            .map_err(|e| failed(e.to_string()))?
            .into_iter()
            .filter(|block| block.tag() == CERTIFICATE_LABEL)
            .map(|block| CertificateDer::from(block.into_contents()))
            .collect()
    } else {
        vec![CertificateDer::from(bytes)]
    };

    if ders.is_empty() {
        return Err(failed(format!("no {CERTIFICATE_LABEL} block found")));
    }
    let leaf = LeafCertificate::from_der(ders.remove(0)).map_err(failed)?;
    for intermediate in &ders {
        x509_parser::parse_x509_certificate(intermediate)
            .map_err(|e| failed(format!("chain certificate: {e}")))?;
    }

    info!(
        path = %path.display(),
        subject = %leaf.subject,
        chain = ders.len(),
        "loaded certificate"
    );
    Ok((leaf, ders))
}
