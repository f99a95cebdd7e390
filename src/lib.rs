//! TPM-backed signing credential for TLS client authentication
//!
//! The private key stays in the TPM. Keys are reached through a persistent
//! handle, a saved context file or a `TSS2 PRIVATE KEY` container, and every
//! object loaded for an operation is flushed before the operation returns.

mod adapters;
pub mod api;
pub mod credential;
pub mod error;
mod logic;
pub mod model;
pub mod ports;
pub mod use_cases;

// Re-export commonly used types
pub use error::{TpmTlsError, TpmTlsResult};

// Re-export public API
pub use adapters::{RawTpmChannel, RawTpmDevice};
pub use api::{create_tss_key, open_credential, public_key_pem, read_public_key};
pub use credential::{Credential, CredentialBuilder, CredentialConfig};
