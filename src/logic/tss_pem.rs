//! PEM envelope for TSS2 containers

use std::fs;
use std::path::Path;

use pem::{EncodeConfig, LineEnding, Pem};
use tracing::info;

use crate::error::{DeviceError, FormatError, TpmTlsResult};
use crate::logic::tss_codec;
use crate::model::TssKey;

pub const TSS2_PEM_LABEL: &str = "TSS2 PRIVATE KEY";

pub fn from_pem(text: &[u8]) -> Result<TssKey, FormatError> {
    let block = pem::parse(text)?;
    if block.tag() != TSS2_PEM_LABEL {
        return Err(FormatError::WrongLabel {
            expected: TSS2_PEM_LABEL,
            found: block.tag().to_string(),
        });
    }
    tss_codec::decode(block.contents())
}

pub fn to_pem(key: &TssKey) -> Result<String, FormatError> {
    let block = Pem::new(TSS2_PEM_LABEL, tss_codec::encode(key)?);
    Ok(pem::encode_config(
        &block,
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    ))
}

pub fn read_tss_file(path: &Path) -> TpmTlsResult<TssKey> {
    let text = fs::read(path).map_err(|source| DeviceError::KeyFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(from_pem(&text)?)
}

pub fn write_tss_file(path: &Path, key: &TssKey) -> TpmTlsResult<()> {
    let text = to_pem(key)?;
    fs::write(path, text).map_err(|source| DeviceError::KeyFile {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), parent = %key.parent, "wrote TSS2 key");
    Ok(())
}
