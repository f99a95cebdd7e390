//! TPM 2.0 command transport over the kernel character device
//!
//! Commands are marshalled by hand and written to `/dev/tpmrm0` (or any
//! `Read + Write` stream). The in-kernel resource manager virtualises
//! transient handles per open file, so every channel starts clean.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{DeviceError, TpmTlsError, TpmTlsResult};
use crate::logic::marshal::{TpmReader, TpmWriter, Underflow};
use crate::model::{Handle, HandleKind, PrimaryTemplate, PublicArea, SignatureScheme};
use crate::ports::{DeviceChannel, TpmDevice};

pub const DEFAULT_TPM_PATH: &str = "/dev/tpmrm0";

const TPM_ST_NO_SESSIONS: u16 = 0x8001;
const TPM_ST_SESSIONS: u16 = 0x8002;
const TPM_ST_HASHCHECK: u16 = 0x8024;

const TPM_RS_PW: u32 = 0x4000_0009;
const TPM_RH_NULL: u32 = 0x4000_0007;
const TPM_CAP_HANDLES: u32 = 0x0000_0001;
const TPM_ALG_SHA256: u16 = 0x000B;

const HEADER_LEN: usize = 10;
const MAX_RESPONSE: usize = 4096;
const HANDLES_PER_PAGE: u32 = 64;

/// TPM_RC_OBJECT_MEMORY, SESSION_MEMORY, SESSION_HANDLES, OBJECT_HANDLES
const SLOT_EXHAUSTION_CODES: [u32; 4] = [0x902, 0x903, 0x905, 0x906];

/// TPM 2.0 command codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TpmCc {
    EvictControl = 0x0000_0120,
    CreatePrimary = 0x0000_0131,
    Load = 0x0000_0157,
    Sign = 0x0000_015D,
    ContextLoad = 0x0000_0161,
    ContextSave = 0x0000_0162,
    FlushContext = 0x0000_0165,
    ReadPublic = 0x0000_0173,
    GetCapability = 0x0000_017A,
}

impl TpmCc {
    fn name(self) -> &'static str {
        match self {
            TpmCc::EvictControl => "TPM2_EvictControl",
            TpmCc::CreatePrimary => "TPM2_CreatePrimary",
            TpmCc::Load => "TPM2_Load",
            TpmCc::Sign => "TPM2_Sign",
            TpmCc::ContextLoad => "TPM2_ContextLoad",
            TpmCc::ContextSave => "TPM2_ContextSave",
            TpmCc::FlushContext => "TPM2_FlushContext",
            TpmCc::ReadPublic => "TPM2_ReadPublic",
            TpmCc::GetCapability => "TPM2_GetCapability",
        }
    }
}

/// Opens TPM character devices
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTpmDevice;

impl TpmDevice for RawTpmDevice {
    type Channel = RawTpmChannel<File>;

    fn open(&self, path: &Path) -> TpmTlsResult<Self::Channel> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DeviceError::OpenFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        debug!(path = %path.display(), "opened TPM");
        Ok(RawTpmChannel::new(device))
    }
}

/// Command channel over an open TPM stream, closed on drop
#[derive(Debug)]
pub struct RawTpmChannel<T: Read + Write = File> {
    stream: T,
}

impl<T: Read + Write> RawTpmChannel<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    /// Send a command body and return the response body
    fn transmit(&mut self, tag: u16, code: TpmCc, body: TpmWriter) -> TpmTlsResult<Vec<u8>> {
        let operation = code.name();
        let command = TpmWriter::new()
            .u16(tag)
            .u32((HEADER_LEN + body.len()) as u32)
            .u32(code as u32)
            .bytes(&body.into_bytes())
            .into_bytes();

        let transport = |e: std::io::Error| DeviceError::Transport {
            operation,
            reason: e.to_string(),
        };

        self.stream.write_all(&command).map_err(transport)?;
        self.stream.flush().map_err(transport)?;

        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).map_err(transport)?;
        let (size, rc) = parse_header(&header).map_err(malformed(operation))?;

        let size = size as usize;
        if !(HEADER_LEN..=MAX_RESPONSE).contains(&size) {
            return Err(DeviceError::UnexpectedResponse {
                operation,
                reason: format!("response size {size}"),
            }
            .into());
        }

        let mut response = vec![0u8; size - HEADER_LEN];
        self.stream.read_exact(&mut response).map_err(transport)?;

        if rc != 0 {
            debug!(operation, rc = format_args!("0x{rc:03x}"), "TPM command failed");
            return Err(response_error(operation, rc));
        }
        Ok(response)
    }

    /// TPM2_EvictControl under the owner hierarchy
    fn evict_control(&mut self, object: Handle, persistent: Handle) -> TpmTlsResult<()> {
        let body = password_auth(
            TpmWriter::new()
                .u32(Handle::OWNER.value())
                .u32(object.value()),
            &[],
        )
        .u32(persistent.value());
        self.transmit(TPM_ST_SESSIONS, TpmCc::EvictControl, body)?;
        Ok(())
    }
}

/// Response size and code from a response header
fn parse_header(header: &[u8]) -> Result<(u32, u32), Underflow> {
    let mut reader = TpmReader::new(header);
    let _tag = reader.u16()?;
    Ok((reader.u32()?, reader.u32()?))
}

fn response_error(operation: &'static str, code: u32) -> TpmTlsError {
    if SLOT_EXHAUSTION_CODES.contains(&code) {
        DeviceError::SlotsExhausted { operation, code }.into()
    } else {
        DeviceError::Command { operation, code }.into()
    }
}

fn malformed(operation: &'static str) -> impl Fn(Underflow) -> TpmTlsError {
    move |e| {
        DeviceError::UnexpectedResponse {
            operation,
            reason: e.to_string(),
        }
        .into()
    }
}

/// Password session authorising the single handle of the command
fn password_auth(body: TpmWriter, password: &[u8]) -> TpmWriter {
    // sessionHandle + nonce + attributes + hmac
    let size = 4 + 2 + 1 + 2 + password.len();
    body.u32(size as u32)
        .u32(TPM_RS_PW)
        .u16(0)
        .u8(0)
        .tpm2b(password)
}

impl<T: Read + Write> DeviceChannel for RawTpmChannel<T> {
    fn list_handles(&mut self, kind: HandleKind) -> TpmTlsResult<Vec<Handle>> {
        let operation = TpmCc::GetCapability.name();
        let mut handles = Vec::new();
        let mut property = kind.first_handle();

        loop {
            let body = TpmWriter::new()
                .u32(TPM_CAP_HANDLES)
                .u32(property)
                .u32(HANDLES_PER_PAGE);
            let response = self.transmit(TPM_ST_NO_SESSIONS, TpmCc::GetCapability, body)?;
            let mut resp = TpmReader::new(&response);

            let more_data = resp.u8().map_err(malformed(operation))? != 0;
            let capability = resp.u32().map_err(malformed(operation))?;
            if capability != TPM_CAP_HANDLES {
                return Err(DeviceError::UnexpectedResponse {
                    operation,
                    reason: format!("capability 0x{capability:08x}"),
                }
                .into());
            }

            let count = resp.u32().map_err(malformed(operation))?;
            let mut last = None;
            for _ in 0..count {
                let handle = Handle::new(resp.u32().map_err(malformed(operation))?);
                last = Some(handle);
                if kind.contains(handle) {
                    handles.push(handle);
                }
            }

            match last {
                Some(handle) if more_data && kind.contains(handle) => {
                    property = handle.value() + 1;
                }
                _ => break,
            }
        }

        debug!(?kind, count = handles.len(), "listed handles");
        Ok(handles)
    }

    fn release(&mut self, handle: Handle) -> TpmTlsResult<()> {
        let body = TpmWriter::new().u32(handle.value());
        self.transmit(TPM_ST_NO_SESSIONS, TpmCc::FlushContext, body)?;
        debug!(%handle, "flushed");
        Ok(())
    }

    fn read_public(&mut self, handle: Handle) -> TpmTlsResult<PublicArea> {
        let operation = TpmCc::ReadPublic.name();
        let body = TpmWriter::new().u32(handle.value());
        let response = self.transmit(TPM_ST_NO_SESSIONS, TpmCc::ReadPublic, body)?;

        let mut resp = TpmReader::new(&response);
        let public = resp.tpm2b().map_err(malformed(operation))?;
        Ok(PublicArea::parse(public)?)
    }

    fn load(
        &mut self,
        parent: Handle,
        auth: &[u8],
        public: &[u8],
        private: &[u8],
    ) -> TpmTlsResult<Handle> {
        let operation = TpmCc::Load.name();
        let body = password_auth(TpmWriter::new().u32(parent.value()), auth)
            .tpm2b(private)
            .tpm2b(public);
        let response = self.transmit(TPM_ST_SESSIONS, TpmCc::Load, body)?;

        let handle = TpmReader::new(&response)
            .u32()
            .map(Handle::new)
            .map_err(malformed(operation))?;
        debug!(%parent, %handle, "loaded key");
        Ok(handle)
    }

    fn create_primary(
        &mut self,
        hierarchy: Handle,
        template: &PrimaryTemplate,
    ) -> TpmTlsResult<Handle> {
        let operation = TpmCc::CreatePrimary.name();
        let body = password_auth(TpmWriter::new().u32(hierarchy.value()), &[])
            // inSensitive: empty userAuth and data
            .u16(4)
            .u16(0)
            .u16(0)
            .tpm2b(&template.marshal())
            .u16(0) // outsideInfo
            .u32(0); // creationPCR
        let response = self.transmit(TPM_ST_SESSIONS, TpmCc::CreatePrimary, body)?;

        let handle = TpmReader::new(&response)
            .u32()
            .map(Handle::new)
            .map_err(malformed(operation))?;
        debug!(%hierarchy, %handle, "created primary");
        Ok(handle)
    }

    fn persist(&mut self, transient: Handle, persistent: Handle) -> TpmTlsResult<()> {
        self.evict_control(transient, persistent)?;
        debug!(%transient, %persistent, "persisted object");
        Ok(())
    }

    fn evict(&mut self, persistent: Handle) -> TpmTlsResult<()> {
        // EvictControl on a persistent object removes it
        self.evict_control(persistent, persistent)?;
        debug!(%persistent, "evicted persistent object");
        Ok(())
    }

    fn context_save(&mut self, handle: Handle) -> TpmTlsResult<Vec<u8>> {
        let body = TpmWriter::new().u32(handle.value());
        self.transmit(TPM_ST_NO_SESSIONS, TpmCc::ContextSave, body)
    }

    fn context_restore(&mut self, context: &[u8]) -> TpmTlsResult<Handle> {
        let operation = TpmCc::ContextLoad.name();
        let body = TpmWriter::new().bytes(context);
        let response = self.transmit(TPM_ST_NO_SESSIONS, TpmCc::ContextLoad, body)?;

        let handle = TpmReader::new(&response)
            .u32()
            .map(Handle::new)
            .map_err(malformed(operation))?;
        debug!(%handle, "restored context");
        Ok(handle)
    }

    fn sign(
        &mut self,
        handle: Handle,
        digest: &[u8],
        scheme: SignatureScheme,
    ) -> TpmTlsResult<Vec<u8>> {
        let operation = TpmCc::Sign.name();
        let body = password_auth(TpmWriter::new().u32(handle.value()), &[])
            .tpm2b(digest)
            .u16(scheme.tpm_alg())
            .u16(TPM_ALG_SHA256)
            // NULL hashcheck ticket
            .u16(TPM_ST_HASHCHECK)
            .u32(TPM_RH_NULL)
            .u16(0);
        let response = self.transmit(TPM_ST_SESSIONS, TpmCc::Sign, body)?;

        let mut resp = TpmReader::new(&response);
        let parameter_size = resp.u32().map_err(malformed(operation))? as usize;
        let start = resp.offset();
        let sig_alg = resp.u16().map_err(malformed(operation))?;
        let hash_alg = resp.u16().map_err(malformed(operation))?;
        if sig_alg != scheme.tpm_alg() || hash_alg != TPM_ALG_SHA256 {
            return Err(DeviceError::UnexpectedResponse {
                operation,
                reason: format!("signature algorithm 0x{sig_alg:04x}/0x{hash_alg:04x}"),
            }
            .into());
        }
        let signature = resp.tpm2b().map_err(malformed(operation))?.to_vec();

        if resp.offset() - start != parameter_size {
            return Err(DeviceError::UnexpectedResponse {
                operation,
                reason: format!(
                    "parameter size {parameter_size}, read {}",
                    resp.offset() - start
                ),
            }
            .into());
        }

        debug!(%handle, %scheme, len = signature.len(), "signed digest");
        Ok(signature)
    }
}
