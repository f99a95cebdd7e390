//! Use cases (orchestration)
//!
//! Each use case opens a channel through the device port, resolves the key
//! and releases whatever it loaded before returning.

mod locate_key;
mod read_public;
mod sign_digest;

pub use locate_key::{HandleGuard, KeyLocator};
pub use read_public::{read_public_key, PublicKeyCache};
pub use sign_digest::sign_digest;
