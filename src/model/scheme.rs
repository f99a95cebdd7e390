//! Signature schemes a TPM RSA key can sign with

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Width of the only supported digest (SHA-256)
pub const DIGEST_LEN: usize = 32;

/// RSA padding scheme, always over SHA-256
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SignatureScheme {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    Pkcs1v15Sha256,
    /// RSASSA-PSS with SHA-256, required for TLS 1.3 client authentication
    #[default]
    PssSha256,
}

impl SignatureScheme {
    pub fn name(self) -> &'static str {
        match self {
            SignatureScheme::Pkcs1v15Sha256 => "pkcs1",
            SignatureScheme::PssSha256 => "pss",
        }
    }

    /// TPM_ALG_ID of the signing scheme
    pub fn tpm_alg(self) -> u16 {
        match self {
            SignatureScheme::Pkcs1v15Sha256 => 0x0014,
            SignatureScheme::PssSha256 => 0x0016,
        }
    }

    pub fn to_rustls(self) -> rustls::SignatureScheme {
        match self {
            SignatureScheme::Pkcs1v15Sha256 => rustls::SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::PssSha256 => rustls::SignatureScheme::RSA_PSS_SHA256,
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SignatureScheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pss" | "rsa-pss" | "sha256-rsa-pss" => Ok(SignatureScheme::PssSha256),
            "pkcs1" | "pkcs1v15" | "sha256-rsa" => Ok(SignatureScheme::Pkcs1v15Sha256),
            _ => Err(ConfigError::UnknownScheme {
                name: s.to_string(),
            }),
        }
    }
}
