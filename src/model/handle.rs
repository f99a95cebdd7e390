use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Reference to an object resident in TPM memory
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Owner hierarchy (TPM_RH_OWNER)
    pub const OWNER: Handle = Handle(0x4000_0001);

    const PERSISTENT_TYPE: u32 = 0x81;
    const TRANSIENT_TYPE: u32 = 0x80;

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Handle type byte (TPM_HT)
    pub const fn handle_type(self) -> u32 {
        self.0 >> 24
    }

    pub const fn is_persistent(self) -> bool {
        self.handle_type() == Self::PERSISTENT_TYPE
    }

    pub const fn is_transient(self) -> bool {
        self.handle_type() == Self::TRANSIENT_TYPE
    }

    /// Parent values that mean "derive a fresh primary under the owner hierarchy"
    pub const fn is_owner_parent(self) -> bool {
        self.0 == 0 || self.0 == Self::OWNER.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(0x{:08x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u32> for Handle {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl FromStr for Handle {
    type Err = HandleError;

    /// Accepts `0x`-prefixed hex or decimal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse::<u32>(),
        };
        parsed.map(Handle).map_err(|_| HandleError::Invalid {
            value: s.to_string(),
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("invalid handle '{value}', expected decimal or 0x-prefixed hex")]
    Invalid { value: String },
}

/// Handle ranges enumerated by the purge step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    LoadedSession,
    SavedSession,
    Transient,
}

impl HandleKind {
    /// Ranges released before first use
    pub const PURGEABLE: [HandleKind; 3] = [
        HandleKind::LoadedSession,
        HandleKind::SavedSession,
        HandleKind::Transient,
    ];

    /// First handle of the range, used as the GetCapability property
    pub const fn first_handle(self) -> u32 {
        match self {
            HandleKind::LoadedSession => 0x0200_0000,
            HandleKind::SavedSession => 0x0300_0000,
            HandleKind::Transient => 0x8000_0000,
        }
    }

    pub const fn contains(self, handle: Handle) -> bool {
        handle.handle_type() == self.first_handle() >> 24
    }
}
