//! Channel key derivation and AEAD framing.
//!
//! Shared secret `S` = X25519 DH of the two ephemeral keys exchanged via
//! `CreateChannel`/`ConfirmChannel`. Let `R` be `S` byte-reversed. Key
//! assignment breaks the tie between the two directions without a
//! protocol round:
//!
//! - `local_id < peer_id`: our decrypt key = `S`, our encrypt key = `R`.
//! - `peer_id < local_id`: swapped.
//! - `local_id == peer_id`: both directions use `S` (talking to self).

use adnl_types::ShortNodeId;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::error::AdnlError;

/// The two AES-256 keys for one side of an established channel.
pub struct ChannelKeys {
    pub decrypt_key: [u8; 32],
    pub encrypt_key: [u8; 32],
}

pub fn derive_channel_keys(
    local_id: ShortNodeId,
    peer_id: ShortNodeId,
    shared: &SharedSecret,
) -> ChannelKeys {
    let s = *shared.as_bytes();
    let mut r = s;
    r.reverse();

    use std::cmp::Ordering;
    match local_id.cmp(&peer_id) {
        Ordering::Less => ChannelKeys {
            decrypt_key: s,
            encrypt_key: r,
        },
        Ordering::Greater => ChannelKeys {
            decrypt_key: r,
            encrypt_key: s,
        },
        Ordering::Equal => ChannelKeys {
            decrypt_key: s,
            encrypt_key: s,
        },
    }
}

pub fn dh(local_secret: &StaticSecret, peer_public: &PublicKey) -> SharedSecret {
    local_secret.diffie_hellman(peer_public)
}

/// The 32-byte id a channel key is addressed by on the wire: callers hash
/// the derived AES key itself, since that's what must be recognisable
/// on every datagram without redoing the DH.
pub fn channel_short_id(aes_key: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"adnl-channel-id");
    hasher.update(aes_key);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Encrypt a `packetContents` for transmission over an established
/// channel. Output excludes the `channel_out_id` prefix; callers prepend
/// it themselves before sending.
pub fn encrypt(encrypt_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, AdnlError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(encrypt_key));
    let mut nonce_bytes = [0u8; 12];
    rand::Rng::fill(&mut rand::rngs::OsRng, &mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ct = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| AdnlError::ProtocolViolation("channel encryption failed".into()))?;
    let mut out = Vec::with_capacity(12 + ct.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

pub fn decrypt(decrypt_key: &[u8; 32], framed: &[u8]) -> Result<Vec<u8>, AdnlError> {
    if framed.len() < 12 {
        return Err(AdnlError::ProtocolViolation("channel frame too short".into()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(decrypt_key));
    let nonce = Nonce::from_slice(&framed[..12]);
    cipher
        .decrypt(nonce, Payload { msg: &framed[12..], aad: &[] })
        .map_err(|_| AdnlError::ProtocolViolation("channel authentication failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(byte: u8) -> ShortNodeId {
        ShortNodeId([byte; 32])
    }

    #[test]
    fn tie_break_is_symmetric_and_antisymmetric() {
        let secret_a = StaticSecret::from([1u8; 32]);
        let secret_b = StaticSecret::from([2u8; 32]);
        let pub_a = PublicKey::from(&secret_a);
        let pub_b = PublicKey::from(&secret_b);

        let shared_a = dh(&secret_a, &pub_b);
        let shared_b = dh(&secret_b, &pub_a);
        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());

        let a = short(1);
        let b = short(2);
        let keys_a = derive_channel_keys(a, b, &shared_a);
        let keys_b = derive_channel_keys(b, a, &shared_b);

        // A's decrypt key is B's encrypt key and vice versa.
        assert_eq!(keys_a.decrypt_key, keys_b.encrypt_key);
        assert_eq!(keys_a.encrypt_key, keys_b.decrypt_key);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [9u8; 32];
        let msg = b"adnl channel payload";
        let framed = encrypt(&key, msg).unwrap();
        let back = decrypt(&key, &framed).unwrap();
        assert_eq!(back, msg);
    }
}
