//! TPM device capability

use std::fmt::Debug;
use std::path::Path;

use crate::error::TpmTlsResult;
use crate::model::{Handle, HandleKind, PrimaryTemplate, PublicArea, SignatureScheme};

/// Capability to open a command channel to a TPM
///
/// Credentials open a fresh channel for every operation and drop it when the
/// operation completes.
pub trait TpmDevice: Send + Sync + Debug {
    type Channel: DeviceChannel;

    /// Open the device at `path`
    ///
    /// # Errors
    ///
    /// `DeviceError::OpenFailed` naming the path when the device cannot be reached
    fn open(&self, path: &Path) -> TpmTlsResult<Self::Channel>;
}

/// Commands issued over an open TPM channel
///
/// Dropping the channel closes it. Objects created through the channel stay
/// resident until released.
pub trait DeviceChannel {
    /// Handles currently present in the range of `kind`
    fn list_handles(&mut self, kind: HandleKind) -> TpmTlsResult<Vec<Handle>>;

    /// Flush a transient object or session
    fn release(&mut self, handle: Handle) -> TpmTlsResult<()>;

    fn read_public(&mut self, handle: Handle) -> TpmTlsResult<PublicArea>;

    /// Load a wrapped key under `parent`
    ///
    /// `public` and `private` are the contents of the TPM2B blobs, without the
    /// size prefix.
    fn load(
        &mut self,
        parent: Handle,
        auth: &[u8],
        public: &[u8],
        private: &[u8],
    ) -> TpmTlsResult<Handle>;

    /// Create a primary key under `hierarchy`, returning a transient handle
    fn create_primary(
        &mut self,
        hierarchy: Handle,
        template: &PrimaryTemplate,
    ) -> TpmTlsResult<Handle>;

    /// Make a transient object persistent at `persistent`
    fn persist(&mut self, transient: Handle, persistent: Handle) -> TpmTlsResult<()>;

    /// Remove the object persisted at `persistent`
    fn evict(&mut self, persistent: Handle) -> TpmTlsResult<()>;

    /// Marshalled TPMS_CONTEXT of a loaded object
    fn context_save(&mut self, handle: Handle) -> TpmTlsResult<Vec<u8>>;

    /// Restore a marshalled TPMS_CONTEXT, returning a transient handle
    fn context_restore(&mut self, context: &[u8]) -> TpmTlsResult<Handle>;

    fn sign(
        &mut self,
        handle: Handle,
        digest: &[u8],
        scheme: SignatureScheme,
    ) -> TpmTlsResult<Vec<u8>>;
}
