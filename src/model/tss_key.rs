use crate::error::FormatError;
use crate::logic::unwrap_tpm2b;
use crate::model::{Handle, PublicArea};

/// OID of a loadable TSS2 key (TCG `id-loadablekey`)
pub const LOADABLE_KEY_OID: &str = "2.23.133.10.1.3";

/// Portable TPM key container
///
/// `public` and `private` hold TPM2B blobs (size prefix included) exactly as
/// they appear in the container. The private blob stays encrypted under the
/// parent until it is loaded into the TPM.
#[derive(Clone, PartialEq, Eq)]
pub struct TssKey {
    pub key_type: String,
    pub empty_auth: bool,
    pub parent: Handle,
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

impl TssKey {
    /// Build a loadable-key container from TPM2B blobs
    pub fn from_blobs(public: Vec<u8>, private: Vec<u8>, parent: Handle) -> Self {
        Self {
            key_type: LOADABLE_KEY_OID.to_string(),
            empty_auth: true,
            parent,
            public,
            private,
        }
    }

    /// Parse the public blob
    pub fn public_area(&self) -> Result<PublicArea, FormatError> {
        PublicArea::parse(unwrap_tpm2b(&self.public)?)
    }
}

// The private blob is wrapped key material; keep it out of logs
impl std::fmt::Debug for TssKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TssKey")
            .field("key_type", &self.key_type)
            .field("empty_auth", &self.empty_auth)
            .field("parent", &self.parent)
            .field("public_len", &self.public.len())
            .field("private_len", &self.private.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::marshal::TpmWriter;
    use crate::model::public_area::tests::{rsa_public_bytes, test_modulus};

    #[test]
    fn test_from_blobs_defaults() {
        let key = TssKey::from_blobs(vec![0, 1, 0xAA], vec![0, 1, 0xBB], Handle::OWNER);
        assert_eq!(key.key_type, LOADABLE_KEY_OID);
        assert!(key.empty_auth);
        assert!(key.parent.is_owner_parent());
    }

    #[test]
    fn test_public_area_unwraps_blob() {
        let public = TpmWriter::new()
            .tpm2b(&rsa_public_bytes(&test_modulus(), 0))
            .into_bytes();
        let key = TssKey::from_blobs(public, vec![0, 0], Handle::OWNER);
        let area = key.public_area().unwrap();
        assert_eq!(area.key_type_name(), "rsa");
    }

    #[test]
    fn test_public_area_rejects_bad_prefix() {
        let key = TssKey::from_blobs(vec![0, 9, 1], vec![0, 0], Handle::OWNER);
        assert!(matches!(key.public_area(), Err(FormatError::Tpm2b { .. })));
    }

    #[test]
    fn test_debug_hides_private_blob() {
        let key = TssKey::from_blobs(vec![0, 1, 0xAA], vec![0, 2, 0xDE, 0xAD], Handle::OWNER);
        let debug = format!("{key:?}");
        assert!(debug.contains("private_len: 4"));
        assert!(!debug.contains("222, 173"));
    }
}
