pub(crate) mod marshal;
mod tss_codec;
mod tss_pem;

pub use tss_codec::{decode, encode, unwrap_tpm2b};
pub use tss_pem::{from_pem, read_tss_file, to_pem, write_tss_file, TSS2_PEM_LABEL};
