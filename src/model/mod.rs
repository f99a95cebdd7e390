mod handle;
mod key_reference;
pub(crate) mod public_area;
mod scheme;
mod tss_key;

pub use handle::{Handle, HandleError, HandleKind};
pub use key_reference::{KeyReference, KeySource};
pub use public_area::{
    EccPublicArea, ObjectAttributes, PrimaryTemplate, PublicArea, RsaPublicArea,
};
pub use scheme::{SignatureScheme, DIGEST_LEN};
pub use tss_key::{TssKey, LOADABLE_KEY_OID};
