use std::path::PathBuf;

use crate::error::ConfigError;
use crate::model::{Handle, TssKey};

/// Flag-style key selection, as gathered from configuration or a command line
#[derive(Debug, Clone, Default)]
pub struct KeySource {
    pub persistent_handle: Option<Handle>,
    pub context_file: Option<PathBuf>,
    pub container: Option<TssKey>,
}

impl KeySource {
    pub fn handle(handle: Handle) -> Self {
        Self {
            persistent_handle: Some(handle),
            ..Self::default()
        }
    }

    pub fn context_file(path: impl Into<PathBuf>) -> Self {
        Self {
            context_file: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn container(key: TssKey) -> Self {
        Self {
            container: Some(key),
            ..Self::default()
        }
    }

    fn populated(&self) -> usize {
        [
            self.persistent_handle.is_some(),
            self.context_file.is_some(),
            self.container.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// Exactly one way of reaching the signing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyReference {
    /// Key already persisted in TPM NV memory
    PersistentHandle(Handle),
    /// Saved TPMS_CONTEXT on disk
    ContextFile(PathBuf),
    /// Wrapped key that is loaded under a primary on each use
    Container(TssKey),
}

impl KeyReference {
    pub fn describe(&self) -> String {
        match self {
            KeyReference::PersistentHandle(handle) => format!("persistent handle {handle}"),
            KeyReference::ContextFile(path) => format!("context file {}", path.display()),
            KeyReference::Container(key) => format!("TSS2 container (parent {})", key.parent),
        }
    }
}

impl TryFrom<KeySource> for KeyReference {
    type Error = ConfigError;

    fn try_from(source: KeySource) -> Result<Self, Self::Error> {
        match source.populated() {
            0 => return Err(ConfigError::NoKeyReference),
            1 => {}
            count => return Err(ConfigError::AmbiguousKeyReference { count }),
        }

        let KeySource {
            persistent_handle,
            context_file,
            container,
        } = source;

        if let Some(handle) = persistent_handle {
            Ok(KeyReference::PersistentHandle(handle))
        } else if let Some(path) = context_file {
            Ok(KeyReference::ContextFile(path))
        } else if let Some(key) = container {
            Ok(KeyReference::Container(key))
        } else {
            Err(ConfigError::NoKeyReference)
        }
    }
}
