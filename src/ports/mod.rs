//! Ports (traits) for TPM access
//!
//! The core depends on these abstractions, not on a concrete TPM stack.
//! `TpmDevice`/`DeviceChannel` is what the key locator drives; `DigestSigner`
//! is what the TLS layer consumes.

mod device;
mod signer;

pub use device::{DeviceChannel, TpmDevice};
pub use signer::DigestSigner;
