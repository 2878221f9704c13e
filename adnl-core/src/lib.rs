//! Local-key custody, signing, and the two cryptographic primitives ADNL
//! sessions are built from: an ECIES-like sealed box for the pre-channel
//! handshake, and the symmetric channel AEAD established afterwards.

pub mod channel_crypto;
pub mod config;
pub mod ecies;
pub mod error;
pub mod keyring;

pub use config::AdnlConfig;
pub use error::AdnlError;
pub use keyring::Keyring;
