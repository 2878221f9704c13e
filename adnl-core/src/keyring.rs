//! Holds local private keys; produces signatures; decrypts inbound
//! ciphertext addressed to a local public-key hash. The sole holder of
//! private key material in the whole system — private keys never leave
//! this type.

use std::collections::HashMap;
use std::sync::Arc;

use adnl_types::{FullNodeId, ShortNodeId};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand_core::OsRng;
use tracing::{debug, warn};

use crate::ecies;
use crate::error::AdnlError;

struct Entry {
    signing_key: SigningKey,
    full_id: FullNodeId,
}

/// Thread-safe store of local identities. Cloning a `Keyring` handle is
/// cheap (an `Arc` bump) the way actors elsewhere in this crate share
/// state through reference-counted handles rather than global mutables.
#[derive(Clone)]
pub struct Keyring {
    inner: Arc<RwLock<HashMap<ShortNodeId, Entry>>>,
}

impl Keyring {
    pub fn new() -> Self {
        Keyring {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Generate a fresh Ed25519 identity and add it under its own short
    /// id. Returns the `FullNodeId` so the caller can publish it.
    pub fn generate(&self) -> FullNodeId {
        let signing_key = SigningKey::generate(&mut OsRng);
        let full_id = FullNodeId(signing_key.verifying_key());
        self.add(signing_key);
        full_id
    }

    pub fn add(&self, signing_key: SigningKey) -> ShortNodeId {
        let full_id = FullNodeId(signing_key.verifying_key());
        let short_id = full_id.short_id();
        self.inner.write().insert(short_id, Entry { signing_key, full_id });
        debug!(%short_id, "keyring: added local identity");
        short_id
    }

    pub fn remove(&self, id: &ShortNodeId) -> bool {
        self.inner.write().remove(id).is_some()
    }

    pub fn full_id(&self, id: &ShortNodeId) -> Option<FullNodeId> {
        self.inner.read().get(id).map(|e| e.full_id)
    }

    pub fn sign(&self, id: &ShortNodeId, data: &[u8]) -> Result<Signature, AdnlError> {
        let guard = self.inner.read();
        let entry = guard
            .get(id)
            .ok_or_else(|| AdnlError::ProtocolViolation(format!("no local key for {id}")))?;
        Ok(entry.signing_key.sign(data))
    }

    pub fn verify(full_id: &FullNodeId, data: &[u8], signature: &Signature) -> bool {
        full_id.0.verify(data, signature).is_ok()
    }

    pub fn verify_bytes(public_key: &[u8; 32], data: &[u8], signature: &[u8; 64]) -> bool {
        let vk = match VerifyingKey::from_bytes(public_key) {
            Ok(vk) => vk,
            Err(_) => return false,
        };
        let sig = Signature::from_bytes(signature);
        vk.verify(data, &sig).is_ok()
    }

    /// Decrypt ciphertext sealed for the local identity `dst`. Used by
    /// `LocalId::decrypt` when a datagram carries no channel prefix.
    pub fn decrypt(&self, dst: &ShortNodeId, ciphertext: &[u8]) -> Result<Vec<u8>, AdnlError> {
        let guard = self.inner.read();
        let entry = guard.get(dst).ok_or_else(|| {
            warn!(id = %dst, "keyring: decrypt for unknown local id");
            AdnlError::UnknownDestination
        })?;
        ecies::open(&entry.signing_key, ciphertext)
    }
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let keyring = Keyring::new();
        let full_id = keyring.generate();
        let short_id = full_id.short_id();
        let sig = keyring.sign(&short_id, b"payload").unwrap();
        assert!(Keyring::verify(&full_id, b"payload", &sig));
    }

    #[test]
    fn decrypt_unknown_destination_errors() {
        let keyring = Keyring::new();
        let bogus = ShortNodeId([0u8; 32]);
        let err = keyring.decrypt(&bogus, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, AdnlError::UnknownDestination));
    }

    #[test]
    fn seal_and_decrypt_via_keyring() {
        let keyring = Keyring::new();
        let full_id = keyring.generate();
        let short_id = full_id.short_id();
        let sealed = crate::ecies::seal(&full_id.0, b"hello peer").unwrap();
        let opened = keyring.decrypt(&short_id, &sealed).unwrap();
        assert_eq!(opened, b"hello peer");
    }
}
