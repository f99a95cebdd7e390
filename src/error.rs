//! Error types for tpm-tls
//!
//! Errors are split by where they are detected: configuration problems are
//! caught at construction before the device is touched, device errors name
//! the failing operation, and format errors carry enough context to diagnose
//! a corrupted key file.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for tpm-tls operations
pub type TpmTlsResult<T> = Result<T, TpmTlsError>;

/// Top-level error type for all tpm-tls operations
#[derive(Error, Debug)]
pub enum TpmTlsError {
    /// Invalid credential or peer configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TPM device or storage errors
    #[error("TPM device error: {0}")]
    Device(#[from] DeviceError),

    /// Malformed key container or TPM structure
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Signing and public key errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors detected while building a credential or a peer configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// None of handle, context file or container was given
    #[error("no key reference: set exactly one of handle, context file or TSS container")]
    NoKeyReference,

    /// More than one key reference was given
    #[error("ambiguous key reference: {count} sources set, exactly one of handle, context file or TSS container is allowed")]
    AmbiguousKeyReference { count: usize },

    /// Base peer configuration already carries a certificate chain
    #[error("certificates must not be set in the base peer configuration")]
    CertificateChainOverride,

    /// Base peer configuration already carries a cipher suite list
    #[error("cipher suites must not be set in the base peer configuration")]
    CipherSuiteOverride,

    /// Signature scheme name not recognised
    #[error("unknown signature scheme '{name}', expected 'pss' or 'pkcs1'")]
    UnknownScheme { name: String },

    /// Certificate could not be read or parsed
    #[error("certificate {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },

    /// Requested cipher suite is not offered by the crypto provider
    #[error("cipher suite {suite} is not supported")]
    UnsupportedCipherSuite { suite: String },

    /// Protocol version bounds are empty or inverted
    #[error("invalid protocol versions: {reason}")]
    ProtocolVersions { reason: String },

    /// rustls refused the assembled configuration
    #[error("TLS configuration rejected: {reason}")]
    Tls { reason: String },
}

/// TPM device and key storage errors
#[derive(Error, Debug)]
pub enum DeviceError {
    /// TPM device could not be opened
    #[error("failed to open TPM at {path}: {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    /// Context file could not be read
    #[error("failed to read context file {path}: {source}")]
    ContextFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TSS2 key file could not be read or written
    #[error("key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TPM ran out of object or session slots
    #[error("{operation}: TPM handle slots exhausted (rc 0x{code:03x})")]
    SlotsExhausted { operation: &'static str, code: u32 },

    /// TPM returned a non-success response code
    #[error("{operation} failed with response code 0x{code:08x}")]
    Command { operation: &'static str, code: u32 },

    /// Reading or writing the device failed
    #[error("{operation}: transport error: {reason}")]
    Transport {
        operation: &'static str,
        reason: String,
    },

    /// Response did not have the expected shape
    #[error("{operation}: unexpected response: {reason}")]
    UnexpectedResponse {
        operation: &'static str,
        reason: String,
    },

    /// Parent handle is neither the owner hierarchy nor a usable persistent key
    #[error("parent key 0x{handle:08x} not found")]
    ParentNotFound { handle: u32 },
}

/// Malformed key container, envelope or TPM structure
#[derive(Error, Debug)]
pub enum FormatError {
    /// ASN.1 structure does not match the TSS2 key layout
    #[error("invalid TSS2 key structure at offset {offset}: {reason} : [{dump}]")]
    Structural {
        offset: usize,
        reason: String,
        dump: String,
    },

    /// Bytes left over after the outer structure
    #[error("unexpected {len} trailing bytes after TSS2 key")]
    TrailingData { len: usize },

    /// PEM block has the wrong label
    #[error("expected PEM block '{expected}', found '{found}'")]
    WrongLabel {
        expected: &'static str,
        found: String,
    },

    /// PEM envelope could not be parsed
    #[error("PEM error: {0}")]
    Pem(#[from] pem::PemError),

    /// Length-prefixed TPM blob is truncated or oversized
    #[error("invalid TPM2B blob: {reason}")]
    Tpm2b { reason: String },

    /// TPMT_PUBLIC could not be parsed
    #[error("invalid public area: {reason}")]
    PublicArea { reason: String },

    /// Container type is not a valid object identifier
    #[error("invalid object identifier '{oid}'")]
    InvalidOid { oid: String },

    /// DER encoding failed
    #[error("DER encoding failed: {0}")]
    Encode(#[from] der::Error),
}

/// Signing and public key errors
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Digest is not a SHA-256 digest
    #[error("digest must be {expected} bytes, got {actual}")]
    InvalidDigestLength { expected: usize, actual: usize },

    /// Caller asked for a scheme the credential was not built with
    #[error("credential signs with {configured}, {requested} was requested")]
    SchemeMismatch {
        configured: &'static str,
        requested: &'static str,
    },

    /// Key is not an RSA key
    #[error("unsupported key type: {key_type}")]
    UnsupportedKeyType { key_type: String },

    /// RSA components were rejected
    #[error("invalid public key: {reason}")]
    InvalidPublicKey { reason: String },
}

/// Convert rsa errors raised while assembling a public key
impl From<rsa::Error> for TpmTlsError {
    fn from(err: rsa::Error) -> Self {
        TpmTlsError::Crypto(CryptoError::InvalidPublicKey {
            reason: err.to_string(),
        })
    }
}

/// Convert rustls configuration errors
impl From<rustls::Error> for TpmTlsError {
    fn from(err: rustls::Error) -> Self {
        TpmTlsError::Config(ConfigError::Tls {
            reason: err.to_string(),
        })
    }
}

impl From<pem::PemError> for TpmTlsError {
    fn from(err: pem::PemError) -> Self {
        TpmTlsError::Format(FormatError::Pem(err))
    }
}
