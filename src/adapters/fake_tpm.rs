//! In-memory TPM that records every command it receives

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{DeviceError, TpmTlsResult};
use crate::model::{Handle, HandleKind, PrimaryTemplate, PublicArea, SignatureScheme};
use crate::ports::{DeviceChannel, TpmDevice};

const RC_HANDLE: u32 = 0x08B;
const RC_OBJECT_MEMORY: u32 = 0x902;
const FIRST_TRANSIENT: u32 = 0x8000_0000;
const CONTEXT_MAGIC: &[u8] = b"FAKECTX";

/// Command seen by the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(PathBuf),
    Close,
    ListHandles(HandleKind),
    Release(Handle),
    ReadPublic(Handle),
    Load { parent: Handle },
    CreatePrimary(Handle),
    Persist { transient: Handle, persistent: Handle },
    Evict(Handle),
    ContextSave(Handle),
    ContextRestore,
    Sign {
        handle: Handle,
        digest: Vec<u8>,
        scheme: SignatureScheme,
    },
}

#[derive(Debug)]
pub struct FakeState {
    pub calls: Vec<Call>,
    /// Transient objects and sessions currently resident
    pub transient: BTreeMap<Handle, PublicArea>,
    pub sessions: BTreeSet<Handle>,
    pub persistent: BTreeMap<Handle, PublicArea>,
    /// Public area given to keys created by `load` and `context_restore`
    pub key_area: PublicArea,
    pub signature: Vec<u8>,
    pub fail_open: bool,
    pub fail_sign: Option<u32>,
    pub fail_load: Option<u32>,
    /// Number of upcoming `read_public` calls that fail
    pub fail_read_public: usize,
    next_transient: u32,
}

/// Recording fake of a TPM, shared between the test and the code under test
#[derive(Debug, Clone)]
pub struct FakeTpm {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTpm {
    /// TPM whose loaded keys report `key_area`
    pub fn new(key_area: PublicArea) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                calls: Vec::new(),
                transient: BTreeMap::new(),
                sessions: BTreeSet::new(),
                persistent: BTreeMap::new(),
                key_area,
                signature: b"fake-signature".to_vec(),
                fail_open: false,
                fail_sign: None,
                fail_load: None,
                fail_read_public: 0,
                next_transient: FIRST_TRANSIENT,
            })),
        }
    }

    /// Key persisted at `handle` with the configured key area
    pub fn with_persistent_key(self, handle: Handle) -> Self {
        {
            let mut state = self.state();
            let area = state.key_area.clone();
            state.persistent.insert(handle, area);
        }
        self
    }

    /// Storage primary persisted at `handle`
    pub fn with_persistent_primary(self, handle: Handle) -> Self {
        let area = primary_area(&PrimaryTemplate::default()).expect("template parses");
        self.state().persistent.insert(handle, area);
        self
    }

    /// Leftover handles from an earlier process
    pub fn with_stale(self, transient: &[Handle], sessions: &[Handle]) -> Self {
        {
            let mut state = self.state();
            for handle in transient {
                let area = state.key_area.clone();
                state.transient.insert(*handle, area);
            }
            state.sessions.extend(sessions.iter().copied());
        }
        self
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| matches(c)).count()
    }

    pub fn live_transients(&self) -> Vec<Handle> {
        self.state().transient.keys().copied().collect()
    }

    /// Bytes `context_restore` accepts
    pub fn context_blob() -> Vec<u8> {
        CONTEXT_MAGIC.to_vec()
    }

    pub fn open_channel(&self) -> FakeChannel {
        FakeChannel {
            state: Arc::clone(&self.state),
        }
    }
}

impl TpmDevice for FakeTpm {
    type Channel = FakeChannel;

    fn open(&self, path: &Path) -> TpmTlsResult<FakeChannel> {
        let mut state = self.state();
        state.calls.push(Call::Open(path.to_path_buf()));
        if state.fail_open {
            return Err(DeviceError::OpenFailed {
                path: path.to_path_buf(),
                reason: "no such device".into(),
            }
            .into());
        }
        drop(state);
        Ok(self.open_channel())
    }
}

#[derive(Debug)]
pub struct FakeChannel {
    state: Arc<Mutex<FakeState>>,
}

impl FakeChannel {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FakeState {
    fn allocate(&mut self, area: PublicArea) -> Handle {
        let handle = Handle::new(self.next_transient);
        self.next_transient += 1;
        self.transient.insert(handle, area);
        handle
    }

    fn lookup(&self, handle: Handle) -> Option<&PublicArea> {
        self.transient
            .get(&handle)
            .or_else(|| self.persistent.get(&handle))
    }
}

fn command_error(operation: &'static str, code: u32) -> crate::TpmTlsError {
    DeviceError::Command { operation, code }.into()
}

fn primary_area(template: &PrimaryTemplate) -> TpmTlsResult<PublicArea> {
    Ok(PublicArea::parse(&template.marshal())?)
}

/// RSA-2048 signing key area used by most fakes
pub fn rsa_key_area() -> PublicArea {
    let bytes = crate::model::public_area::tests::rsa_public_bytes(
        &crate::model::public_area::tests::test_modulus(),
        0,
    );
    PublicArea::parse(&bytes).expect("well-formed test area")
}

impl DeviceChannel for FakeChannel {
    fn list_handles(&mut self, kind: HandleKind) -> TpmTlsResult<Vec<Handle>> {
        let mut state = self.state();
        state.calls.push(Call::ListHandles(kind));
        let handles = match kind {
            HandleKind::Transient => state.transient.keys().copied().collect(),
            _ => state
                .sessions
                .iter()
                .copied()
                .filter(|h| kind.contains(*h))
                .collect(),
        };
        Ok(handles)
    }

    fn release(&mut self, handle: Handle) -> TpmTlsResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Release(handle));
        if state.transient.remove(&handle).is_some() || state.sessions.remove(&handle) {
            Ok(())
        } else {
            Err(command_error("TPM2_FlushContext", RC_HANDLE))
        }
    }

    fn read_public(&mut self, handle: Handle) -> TpmTlsResult<PublicArea> {
        let mut state = self.state();
        state.calls.push(Call::ReadPublic(handle));
        if state.fail_read_public > 0 {
            state.fail_read_public -= 1;
            return Err(command_error("TPM2_ReadPublic", RC_HANDLE));
        }
        state
            .lookup(handle)
            .cloned()
            .ok_or_else(|| command_error("TPM2_ReadPublic", RC_HANDLE))
    }

    fn load(
        &mut self,
        parent: Handle,
        _auth: &[u8],
        _public: &[u8],
        _private: &[u8],
    ) -> TpmTlsResult<Handle> {
        let mut state = self.state();
        state.calls.push(Call::Load { parent });
        if let Some(code) = state.fail_load {
            return Err(if code == RC_OBJECT_MEMORY {
                DeviceError::SlotsExhausted {
                    operation: "TPM2_Load",
                    code,
                }
                .into()
            } else {
                command_error("TPM2_Load", code)
            });
        }
        if state.lookup(parent).is_none() {
            return Err(command_error("TPM2_Load", RC_HANDLE));
        }
        let area = state.key_area.clone();
        Ok(state.allocate(area))
    }

    fn create_primary(
        &mut self,
        hierarchy: Handle,
        template: &PrimaryTemplate,
    ) -> TpmTlsResult<Handle> {
        let mut state = self.state();
        state.calls.push(Call::CreatePrimary(hierarchy));
        let area = primary_area(template)?;
        Ok(state.allocate(area))
    }

    fn persist(&mut self, transient: Handle, persistent: Handle) -> TpmTlsResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Persist {
            transient,
            persistent,
        });
        let Some(area) = state.transient.get(&transient).cloned() else {
            return Err(command_error("TPM2_EvictControl", RC_HANDLE));
        };
        state.persistent.insert(persistent, area);
        Ok(())
    }

    fn evict(&mut self, persistent: Handle) -> TpmTlsResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Evict(persistent));
        match state.persistent.remove(&persistent) {
            Some(_) => Ok(()),
            None => Err(command_error("TPM2_EvictControl", RC_HANDLE)),
        }
    }

    fn context_save(&mut self, handle: Handle) -> TpmTlsResult<Vec<u8>> {
        let mut state = self.state();
        state.calls.push(Call::ContextSave(handle));
        if !state.transient.contains_key(&handle) {
            return Err(command_error("TPM2_ContextSave", RC_HANDLE));
        }
        let mut blob = CONTEXT_MAGIC.to_vec();
        blob.extend(handle.value().to_be_bytes());
        Ok(blob)
    }

    fn context_restore(&mut self, context: &[u8]) -> TpmTlsResult<Handle> {
        let mut state = self.state();
        state.calls.push(Call::ContextRestore);
        if !context.starts_with(CONTEXT_MAGIC) {
            return Err(command_error("TPM2_ContextLoad", 0x1C2));
        }
        // Saved primaries come back as themselves, anything else as the key
        let saved = context[CONTEXT_MAGIC.len()..]
            .first_chunk::<4>()
            .map(|b| Handle::new(u32::from_be_bytes(*b)));
        let area = match saved {
            Some(_) => primary_area(&PrimaryTemplate::default())?,
            None => state.key_area.clone(),
        };
        Ok(state.allocate(area))
    }

    fn sign(
        &mut self,
        handle: Handle,
        digest: &[u8],
        scheme: SignatureScheme,
    ) -> TpmTlsResult<Vec<u8>> {
        let mut state = self.state();
        state.calls.push(Call::Sign {
            handle,
            digest: digest.to_vec(),
            scheme,
        });
        if let Some(code) = state.fail_sign {
            return Err(command_error("TPM2_Sign", code));
        }
        if state.lookup(handle).is_none() {
            return Err(command_error("TPM2_Sign", RC_HANDLE));
        }
        Ok(state.signature.clone())
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.state().calls.push(Call::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract_tests_for;
    use crate::ports::contract_tests::device_contract;

    contract_tests_for!(
        fake_tpm_contract,
        make = || FakeTpm::new(rsa_key_area()).open_channel(),
        tests = {
            test_create_primary_is_transient => device_contract::test_create_primary_is_transient,
            test_primary_public_area_is_ecc => device_contract::test_primary_public_area_is_ecc,
            test_release_unknown_handle_fails => device_contract::test_release_unknown_handle_fails,
            test_read_public_absent_persistent_fails => device_contract::test_read_public_absent_persistent_fails,
            test_context_round_trip => device_contract::test_context_round_trip,
        }
    );

    #[test]
    fn test_records_calls_and_close() {
        let tpm = FakeTpm::new(rsa_key_area());
        {
            let mut channel = tpm.open(Path::new("/dev/tpmrm0")).unwrap();
            let primary = channel
                .create_primary(Handle::OWNER, &PrimaryTemplate::default())
                .unwrap();
            channel.release(primary).unwrap();
        }
        let calls = tpm.calls();
        assert_eq!(calls.first(), Some(&Call::Open(PathBuf::from("/dev/tpmrm0"))));
        assert_eq!(calls.last(), Some(&Call::Close));
        assert!(tpm.live_transients().is_empty());
    }

    #[test]
    fn test_injected_open_failure() {
        let tpm = FakeTpm::new(rsa_key_area());
        tpm.state().fail_open = true;
        assert!(tpm.open(Path::new("/dev/tpmrm0")).is_err());
    }

    #[test]
    fn test_restored_key_context_has_key_area() {
        let tpm = FakeTpm::new(rsa_key_area());
        let mut channel = tpm.open_channel();
        let handle = channel.context_restore(&FakeTpm::context_blob()).unwrap();
        assert_eq!(channel.read_public(handle).unwrap(), rsa_key_area());
    }
}
