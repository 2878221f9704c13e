//! Node identities: a `FullNodeId` is an Ed25519 public key, a `ShortNodeId`
//! is the 32-byte hash of its canonical serialisation. Everything in ADNL
//! that needs to name a peer uses the short form.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 32-byte hash of a `FullNodeId`'s canonical encoding. Cheap to copy,
/// cheap to use as a map key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShortNodeId(pub [u8; 32]);

impl ShortNodeId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ShortNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for ShortNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// An Ed25519 public key identifying a node. `ShortNodeId::from(&full)`
/// is the canonical way to get a handle suitable for maps and wire
/// addressing.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct FullNodeId(#[serde(with = "serde_verifying_key")] pub VerifyingKey);

impl FullNodeId {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, ed25519_dalek::SignatureError> {
        VerifyingKey::from_bytes(bytes).map(FullNodeId)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn short_id(&self) -> ShortNodeId {
        // Canonical serialisation is just the raw 32-byte public key; TL
        // pubkey objects wrap it with a constructor id, but the hash is
        // taken over the same bytes the pack's key-handling code uses
        // (tagged public-key serialisation collapses to this for Ed25519).
        let mut hasher = Sha256::new();
        hasher.update(b"pub.ed25519");
        hasher.update(self.0.to_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        ShortNodeId(out)
    }
}

impl PartialEq for FullNodeId {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bytes() == other.0.to_bytes()
    }
}
impl Eq for FullNodeId {}

impl fmt::Debug for FullNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FullNodeId({})", self.short_id())
    }
}

impl From<&FullNodeId> for ShortNodeId {
    fn from(full: &FullNodeId) -> Self {
        full.short_id()
    }
}

mod serde_verifying_key {
    use ed25519_dalek::VerifyingKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &VerifyingKey, s: S) -> Result<S::Ok, S::Error> {
        key.to_bytes().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<VerifyingKey, D::Error> {
        let bytes = <[u8; 32]>::deserialize(d)?;
        VerifyingKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    #[test]
    fn short_id_is_stable() {
        let sk = SigningKey::generate(&mut OsRng);
        let full = FullNodeId(sk.verifying_key());
        let a = full.short_id();
        let b = full.short_id();
        assert_eq!(a, b);
    }

    #[test]
    fn ordering_is_total() {
        let sk1 = SigningKey::generate(&mut OsRng);
        let sk2 = SigningKey::generate(&mut OsRng);
        let a = FullNodeId(sk1.verifying_key()).short_id();
        let b = FullNodeId(sk2.verifying_key()).short_id();
        assert!(a < b || b < a || a == b);
    }
}
