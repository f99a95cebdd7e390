//! DigestSigner trait - capability to sign SHA-256 digests

use std::fmt::Debug;

use rsa::RsaPublicKey;

use crate::error::TpmTlsResult;
use crate::model::SignatureScheme;

/// Capability to sign pre-hashed data with a key that never leaves its device
///
/// The TLS layer only sees this trait, never the credential behind it.
pub trait DigestSigner: Send + Sync + Debug {
    /// Public half of the signing key, `None` if it could not be read
    fn public_key(&self) -> Option<RsaPublicKey>;

    /// Sign a SHA-256 digest
    ///
    /// # Arguments
    ///
    /// * `digest` - 32 byte SHA-256 digest
    /// * `scheme` - padding scheme, must match the one the signer was built with
    ///
    /// # Errors
    ///
    /// Returns errors if:
    /// - the digest is not 32 bytes
    /// - the scheme differs from [`DigestSigner::scheme`]
    /// - the key cannot be loaded or the device refuses to sign
    fn sign(&self, digest: &[u8], scheme: SignatureScheme) -> TpmTlsResult<Vec<u8>>;

    /// Scheme the signer was built with
    fn scheme(&self) -> SignatureScheme;
}
