//! The "sealed box" used to encrypt a `packetContents` directly to a
//! peer's long-term identity, before any channel exists. The scheme:
//! convert both sides' Ed25519 keys to Curve25519 (the standard
//! birational map), do an ephemeral-static X25519 DH, and use the
//! shared secret as an AES-GCM key with the ephemeral public key
//! prefixed to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret as XStaticSecret};

use crate::error::AdnlError;

/// Convert an Ed25519 signing key into the X25519 static secret whose
/// public counterpart is `ed25519_public_to_x25519(verifying_key)`. This
/// is the same `SHA-512(seed)[0..32]`-then-clamp construction libsodium
/// uses for `crypto_sign_ed25519_sk_to_curve25519`.
pub fn ed25519_signing_to_x25519(signing_key: &SigningKey) -> XStaticSecret {
    let mut hasher = Sha512::new();
    hasher.update(signing_key.to_bytes());
    let digest = hasher.finalize();
    let mut scalar_bytes = [0u8; 32];
    scalar_bytes.copy_from_slice(&digest[..32]);
    XStaticSecret::from(scalar_bytes)
}

/// Convert an Ed25519 public key into its X25519 (Montgomery) form via
/// the standard birational map between the two curve models.
pub fn ed25519_public_to_x25519(verifying_key: &VerifyingKey) -> Result<XPublicKey, AdnlError> {
    let compressed = CompressedEdwardsY(verifying_key.to_bytes());
    let point = compressed
        .decompress()
        .ok_or_else(|| AdnlError::ProtocolViolation("invalid ed25519 public key".into()))?;
    let montgomery: MontgomeryPoint = point.to_montgomery();
    Ok(XPublicKey::from(montgomery.to_bytes()))
}

/// `sealed = ephemeral_pub(32) || nonce(12) || AES-256-GCM(shared_key, nonce, plaintext)`.
pub fn seal(recipient: &VerifyingKey, plaintext: &[u8]) -> Result<Vec<u8>, AdnlError> {
    let recipient_x = ed25519_public_to_x25519(recipient)?;
    let ephemeral = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pub = XPublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_x);
    let key = derive_aes_key(shared.as_bytes(), b"adnl-ecies-seal");

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let mut nonce_bytes = [0u8; 12];
    rand::Rng::fill(&mut rand::rngs::OsRng, &mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ct = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: ephemeral_pub.as_bytes() })
        .map_err(|_| AdnlError::ProtocolViolation("seal encryption failed".into()))?;

    let mut out = Vec::with_capacity(32 + 12 + ct.len());
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

pub fn open(local_signing_key: &SigningKey, sealed: &[u8]) -> Result<Vec<u8>, AdnlError> {
    if sealed.len() < 32 + 12 {
        return Err(AdnlError::ProtocolViolation("sealed box too short".into()));
    }
    let ephemeral_pub_bytes: [u8; 32] = sealed[0..32].try_into().unwrap();
    let ephemeral_pub = XPublicKey::from(ephemeral_pub_bytes);
    let nonce_bytes = &sealed[32..44];
    let ct = &sealed[44..];

    let local_x = ed25519_signing_to_x25519(local_signing_key);
    let shared = local_x.diffie_hellman(&ephemeral_pub);
    let key = derive_aes_key(shared.as_bytes(), b"adnl-ecies-seal");

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ct, aad: &ephemeral_pub_bytes })
        .map_err(|_| AdnlError::ProtocolViolation("sealed box authentication failed".into()))
}

fn derive_aes_key(shared_secret: &[u8], context: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(context);
    hasher.update(shared_secret);
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn seal_open_roundtrip() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let msg = b"adnl packet contents";
        let sealed = seal(&vk, msg).unwrap();
        let opened = open(&sk, &sealed).unwrap();
        assert_eq!(opened, msg);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let mut sealed = seal(&vk, b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open(&sk, &sealed).is_err());
    }
}
