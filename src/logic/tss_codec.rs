//! DER codec for the TSS2 loadable key container
//!
//! ```text
//! TPMKey ::= SEQUENCE {
//!     type        OBJECT IDENTIFIER,
//!     emptyAuth   [0] EXPLICIT BOOLEAN,
//!     parent      INTEGER,
//!     pubkey      OCTET STRING,
//!     privkey     OCTET STRING
//! }
//! ```

use der::asn1::{ObjectIdentifier, OctetStringRef};
use der::{Decode, Encode, Header, Length, Reader, SliceReader, Tag, TagNumber};
use tracing::debug;

use crate::error::FormatError;
use crate::model::{Handle, TssKey};

const EMPTY_AUTH_TAG: Tag = Tag::ContextSpecific {
    constructed: true,
    number: TagNumber::N0,
};

/// Decode a DER TSS2 container
pub fn decode(bytes: &[u8]) -> Result<TssKey, FormatError> {
    let mut decoder = Decoder::new(bytes)?;

    let body_start = decoder.expect_header(Tag::Sequence, "TSS2 key")?;
    let seq_end = body_start + decoder.last_len;
    if seq_end > bytes.len() {
        return Err(decoder.structural(
            0,
            format!(
                "SEQUENCE claims {} bytes, only {} available",
                decoder.last_len,
                bytes.len() - body_start
            ),
        ));
    }

    let key_type = decoder.field("type", Tag::ObjectIdentifier, |r| {
        r.decode::<ObjectIdentifier>()
    })?;

    let auth_start = decoder.expect_header(EMPTY_AUTH_TAG, "emptyAuth")?;
    let auth_len = decoder.last_len;
    let empty_auth = decoder.flag("emptyAuth")?;
    if decoder.position() != auth_start + auth_len {
        return Err(decoder.structural(auth_start, "emptyAuth: [0] length mismatch".into()));
    }

    let parent = decoder.parent()?;
    let public = decoder.field("pubkey", Tag::OctetString, |r| {
        r.decode::<OctetStringRef<'_>>().map(|o| o.as_bytes().to_vec())
    })?;
    let private = decoder.field("privkey", Tag::OctetString, |r| {
        r.decode::<OctetStringRef<'_>>().map(|o| o.as_bytes().to_vec())
    })?;

    let end = decoder.position();
    if end != seq_end {
        return Err(decoder.structural(
            end,
            format!("SEQUENCE ends at offset {seq_end} but fields end at {end}"),
        ));
    }
    if end < bytes.len() {
        return Err(FormatError::TrailingData {
            len: bytes.len() - end,
        });
    }

    let key = TssKey {
        key_type: key_type.to_string(),
        empty_auth,
        parent,
        public,
        private,
    };
    debug!(parent = %key.parent, key_type = %key.key_type, "decoded TSS2 key");
    Ok(key)
}

/// Encode a container as canonical DER
pub fn encode(key: &TssKey) -> Result<Vec<u8>, FormatError> {
    let oid = ObjectIdentifier::new(&key.key_type).map_err(|_| FormatError::InvalidOid {
        oid: key.key_type.clone(),
    })?;

    let auth = key.empty_auth.to_der()?;
    let mut body = oid.to_der()?;
    body.extend(Header::new(EMPTY_AUTH_TAG, Length::try_from(auth.len())?)?.to_der()?);
    body.extend(auth);
    body.extend(encode_parent(key.parent));
    body.extend(OctetStringRef::new(&key.public)?.to_der()?);
    body.extend(OctetStringRef::new(&key.private)?.to_der()?);

    let mut out = Header::new(Tag::Sequence, Length::try_from(body.len())?)?.to_der()?;
    out.extend(body);
    Ok(out)
}

/// Strip the u16 size prefix of a TPM2B blob
pub fn unwrap_tpm2b(blob: &[u8]) -> Result<&[u8], FormatError> {
    let Some((size, payload)) = blob.split_first_chunk::<2>() else {
        return Err(FormatError::Tpm2b {
            reason: format!("{} bytes is too short for a size prefix", blob.len()),
        });
    };
    let size = u16::from_be_bytes(*size) as usize;
    if payload.len() != size {
        return Err(FormatError::Tpm2b {
            reason: format!("size prefix says {size} bytes, blob carries {}", payload.len()),
        });
    }
    Ok(payload)
}

/// Parent handle as a non-negative INTEGER, minimal length
fn encode_parent(parent: Handle) -> Vec<u8> {
    let be = parent.value().to_be_bytes();
    let skip = be.iter().take(3).take_while(|b| **b == 0).count();
    let mut content = be[skip..].to_vec();
    if content[0] & 0x80 != 0 {
        content.insert(0, 0);
    }
    let mut out = vec![0x02, content.len() as u8];
    out.extend(content);
    out
}

/// Space separated hex dump, as shown in structural errors
fn dump(bytes: &[u8]) -> String {
    bytes.chunks(1).map(hex::encode).collect::<Vec<_>>().join(" ")
}

struct Decoder<'a> {
    bytes: &'a [u8],
    reader: SliceReader<'a>,
    last_len: usize,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self, FormatError> {
        let reader = SliceReader::new(bytes).map_err(|e| FormatError::Structural {
            offset: 0,
            reason: e.to_string(),
            dump: dump(bytes),
        })?;
        Ok(Self {
            bytes,
            reader,
            last_len: 0,
        })
    }

    fn position(&self) -> usize {
        u32::from(self.reader.position()) as usize
    }

    fn structural(&self, offset: usize, reason: String) -> FormatError {
        FormatError::Structural {
            offset,
            reason,
            dump: dump(self.bytes),
        }
    }

    fn peek(&mut self, what: &str, expected: Tag) -> Result<usize, FormatError> {
        let offset = self.position();
        let found = self
            .reader
            .peek_tag()
            .map_err(|e| self.structural(offset, format!("{what}: {e}")))?;
        if found != expected {
            return Err(self.structural(
                offset,
                format!("{what}: expected {expected}, found {found}"),
            ));
        }
        Ok(offset)
    }

    /// Read a header with the given tag, returning the offset of its contents
    fn expect_header(&mut self, expected: Tag, what: &str) -> Result<usize, FormatError> {
        let offset = self.peek(what, expected)?;
        let header = Header::decode(&mut self.reader)
            .map_err(|e| self.structural(offset, format!("{what}: {e}")))?;
        self.last_len = u32::from(header.length) as usize;
        Ok(self.position())
    }

    fn field<T>(
        &mut self,
        what: &str,
        expected: Tag,
        read: impl FnOnce(&mut SliceReader<'a>) -> der::Result<T>,
    ) -> Result<T, FormatError> {
        let offset = self.peek(what, expected)?;
        read(&mut self.reader).map_err(|e| self.structural(offset, format!("{what}: {e}")))
    }

    /// One byte BOOLEAN, any nonzero content is true
    ///
    /// Encoders that wrote the field as an ASN.1 flag emit `01` for TRUE.
    fn flag(&mut self, what: &str) -> Result<bool, FormatError> {
        let offset = self.peek(what, Tag::Boolean)?;
        let header = Header::decode(&mut self.reader)
            .map_err(|e| self.structural(offset, format!("{what}: {e}")))?;
        let content = self
            .reader
            .read_slice(header.length)
            .map_err(|e| self.structural(offset, format!("{what}: {e}")))?;
        match content {
            [value] => Ok(*value != 0),
            _ => Err(self.structural(
                offset,
                format!("{what}: {} byte BOOLEAN", content.len()),
            )),
        }
    }

    /// Non-negative 32-bit INTEGER, or a four byte negative one written by
    /// encoders that treat the handle as a signed value
    fn parent(&mut self) -> Result<Handle, FormatError> {
        let offset = self.peek("parent", Tag::Integer)?;
        let header = Header::decode(&mut self.reader)
            .map_err(|e| self.structural(offset, format!("parent: {e}")))?;
        let content = self
            .reader
            .read_slice(header.length)
            .map_err(|e| self.structural(offset, format!("parent: {e}")))?;

        let value = match content {
            [] => None,
            [first, ..] if first & 0x80 != 0 => <[u8; 4]>::try_from(content)
                .ok()
                .map(u32::from_be_bytes),
            [0, rest @ ..] if !rest.is_empty() => be_u32(rest),
            _ => be_u32(content),
        };

        value.map(Handle::new).ok_or_else(|| {
            self.structural(
                offset,
                format!("parent: {} byte INTEGER is not a 32-bit handle", content.len()),
            )
        })
    }
}

fn be_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}
