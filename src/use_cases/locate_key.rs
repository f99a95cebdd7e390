//! Resolve a key reference into a live TPM handle

use std::fs;

use tracing::{debug, info, warn};

use crate::error::{DeviceError, TpmTlsResult};
use crate::logic::unwrap_tpm2b;
use crate::model::{Handle, HandleKind, KeyReference, PrimaryTemplate, TssKey};
use crate::ports::DeviceChannel;

/// Handle that is flushed when the guard goes out of scope
///
/// Persistent handles are passed through and never flushed.
#[derive(Debug)]
pub struct HandleGuard<'c, C: DeviceChannel> {
    channel: &'c mut C,
    handle: Handle,
    flush: bool,
}

impl<'c, C: DeviceChannel> HandleGuard<'c, C> {
    /// Guard that flushes `handle` on drop
    pub fn transient(channel: &'c mut C, handle: Handle) -> Self {
        Self {
            channel,
            handle,
            flush: true,
        }
    }

    /// Guard over a handle owned by someone else
    pub fn borrowed(channel: &'c mut C, handle: Handle) -> Self {
        Self {
            channel,
            handle,
            flush: false,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn is_transient(&self) -> bool {
        self.flush
    }

    /// Channel the handle lives on
    pub fn channel(&mut self) -> &mut C {
        self.channel
    }

    /// Flush now, reporting failure instead of logging it
    pub fn release(mut self) -> TpmTlsResult<()> {
        if !self.flush {
            return Ok(());
        }
        self.flush = false;
        self.channel.release(self.handle)
    }
}

impl<C: DeviceChannel> Drop for HandleGuard<'_, C> {
    fn drop(&mut self) {
        if self.flush {
            if let Err(e) = self.channel.release(self.handle) {
                warn!(handle = %self.handle, "failed to flush handle: {e}");
            }
        }
    }
}

/// Turns key references into handles on an open channel
#[derive(Debug, Clone, Default)]
pub struct KeyLocator {
    template: PrimaryTemplate,
}

impl KeyLocator {
    /// Make the referenced key usable, returning a guard for its handle
    ///
    /// Container keys are loaded under a freshly derived primary which is
    /// flushed before this returns.
    pub fn locate<'c, C: DeviceChannel>(
        &self,
        channel: &'c mut C,
        reference: &KeyReference,
    ) -> TpmTlsResult<HandleGuard<'c, C>> {
        match reference {
            KeyReference::PersistentHandle(handle) => {
                debug!(%handle, "using persistent key");
                Ok(HandleGuard::borrowed(channel, *handle))
            }
            KeyReference::ContextFile(path) => {
                let context = fs::read(path).map_err(|source| DeviceError::ContextFile {
                    path: path.clone(),
                    source,
                })?;
                let handle = channel.context_restore(&context)?;
                info!(%handle, path = %path.display(), "restored key context");
                Ok(HandleGuard::transient(channel, handle))
            }
            KeyReference::Container(key) => self.load_container(channel, key),
        }
    }

    fn load_container<'c, C: DeviceChannel>(
        &self,
        channel: &'c mut C,
        key: &TssKey,
    ) -> TpmTlsResult<HandleGuard<'c, C>> {
        let public = unwrap_tpm2b(&key.public)?;
        let private = unwrap_tpm2b(&key.private)?;
        if !key.empty_auth {
            warn!(parent = %key.parent, "key has an auth value, loading with empty auth");
        }

        let mut primary = self.primary(&mut *channel, key.parent)?;
        let parent = primary.handle();
        let child = primary.channel().load(parent, &[], public, private)?;

        if let Err(e) = primary.release() {
            warn!(%parent, "failed to flush primary: {e}");
        }
        info!(%parent, handle = %child, "loaded TSS2 key");
        Ok(HandleGuard::transient(channel, child))
    }

    /// Storage primary the container key was wrapped under
    ///
    /// An owner parent is derived on every call. A persistent parent is used
    /// in place. It is created from the template and persisted if missing, and
    /// replaced if the object there was not made from the template.
    fn primary<'c, C: DeviceChannel>(
        &self,
        channel: &'c mut C,
        parent: Handle,
    ) -> TpmTlsResult<HandleGuard<'c, C>> {
        if parent.is_owner_parent() {
            let handle = channel.create_primary(Handle::OWNER, &self.template)?;
            debug!(%handle, "created owner primary");
            return Ok(HandleGuard::transient(channel, handle));
        }

        match channel.read_public(parent) {
            Ok(area) if self.template.matches(&area) || !parent.is_persistent() => {
                Ok(HandleGuard::borrowed(channel, parent))
            }
            Ok(area) => {
                warn!(
                    %parent,
                    key_type = area.key_type_name(),
                    "persistent parent does not match the storage template, replacing it"
                );
                channel.evict(parent)?;
                self.persist_primary(channel, parent)
            }
            Err(e) if parent.is_persistent() => {
                debug!(%parent, "parent not present ({e}), creating it");
                self.persist_primary(channel, parent)
            }
            Err(_) => Err(DeviceError::ParentNotFound {
                handle: parent.value(),
            }
            .into()),
        }
    }

    fn persist_primary<'c, C: DeviceChannel>(
        &self,
        channel: &'c mut C,
        parent: Handle,
    ) -> TpmTlsResult<HandleGuard<'c, C>> {
        let transient = channel.create_primary(Handle::OWNER, &self.template)?;
        let mut guard = HandleGuard::transient(&mut *channel, transient);
        guard.channel().persist(transient, parent)?;
        guard.release()?;
        info!(%parent, "persisted storage primary");
        Ok(HandleGuard::borrowed(channel, parent))
    }

    /// Flush every loaded session, saved session and transient object
    pub fn purge<C: DeviceChannel>(&self, channel: &mut C) -> TpmTlsResult<usize> {
        let mut flushed = 0;
        for kind in HandleKind::PURGEABLE {
            for handle in channel.list_handles(kind)? {
                channel.release(handle)?;
                flushed += 1;
            }
        }
        if flushed > 0 {
            info!(flushed, "purged stale TPM handles");
        }
        Ok(flushed)
    }
}
