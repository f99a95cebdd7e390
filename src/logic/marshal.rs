//! Big-endian marshalling helpers for TPM 2.0 structures

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("buffer underflow: need {needed} bytes at offset {offset}, {available} available")]
pub struct Underflow {
    pub needed: usize,
    pub offset: usize,
    pub available: usize,
}

/// Builder for TPM command and structure bytes
#[derive(Debug, Default)]
pub(crate) struct TpmWriter {
    data: Vec<u8>,
}

impl TpmWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn u8(mut self, val: u8) -> Self {
        self.data.push(val);
        self
    }

    pub(crate) fn u16(mut self, val: u16) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub(crate) fn u32(mut self, val: u32) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub(crate) fn bytes(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// TPM2B: u16 size followed by the payload
    pub(crate) fn tpm2b(self, bytes: &[u8]) -> Self {
        // Callers only pass TPM-sized payloads
        self.u16(bytes.len() as u16).bytes(bytes)
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Cursor over TPM response or structure bytes
#[derive(Debug)]
pub(crate) struct TpmReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TpmReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Underflow> {
        if len > self.remaining() {
            return Err(Underflow {
                needed: len,
                offset: self.offset,
                available: self.remaining(),
            });
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, Underflow> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, Underflow> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, Underflow> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], Underflow> {
        self.take(len)
    }

    pub(crate) fn tpm2b(&mut self) -> Result<&'a [u8], Underflow> {
        let size = self.u16()? as usize;
        self.take(size)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }
}
