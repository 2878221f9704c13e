//! The channel handshake state machine and the AES framing built on top
//! of it. A `Channel` lives inside its owning `PeerPair`'s state — the
//! PeerTable only ever holds a *registration* (`in_id -> local_id`)
//! pointing back at the PeerPair, never the channel itself. The Channel
//! never owns its owning PeerPair; the PeerPair owns the Channel and the
//! PeerTable holds a weak registration entry.

use adnl_core::channel_crypto::{self, ChannelKeys};
use adnl_types::{Message, ShortNodeId};
use rand_core::{OsRng, RngCore};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelPhase {
    None,
    Inited,
    Ready,
}

/// Outcome of feeding a `CreateChannel`/`ConfirmChannel` into the state
/// machine, telling the caller (PeerPair) what registry bookkeeping and
/// follow-up sends are needed.
pub enum ChannelEvent {
    /// Channel (re)initialised onto a new key; caller must register the
    /// new `in_id` and, if `old_in_id` is set, unregister it first.
    Updated { old_in_id: Option<[u8; 32]>, should_confirm: bool },
    /// Same key already stored, or an older/equal date: ignore.
    NoOp,
    /// `ConfirmChannel` whose echoed key doesn't match ours: drop.
    Rejected,
}

pub struct Channel {
    local_id: ShortNodeId,
    peer_id: ShortNodeId,
    local_secret: StaticSecret,
    local_public: PublicKey,
    local_pub_date: i32,
    peer_public: Option<PublicKey>,
    peer_pub_date: i32,
    phase: ChannelPhase,
    in_id: Option<[u8; 32]>,
    out_id: Option<[u8; 32]>,
    decrypt_key: Option<[u8; 32]>,
    encrypt_key: Option<[u8; 32]>,
}

impl Channel {
    pub fn new(local_id: ShortNodeId, peer_id: ShortNodeId, now: i32) -> Self {
        // A plain `StaticSecret` rather than `EphemeralSecret`: the key
        // is single-use in the protocol sense (superseded by a fresh one
        // on reinit) but needs to survive past one `diffie_hellman` call
        // since the channel can be re-confirmed.
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let local_secret = StaticSecret::from(seed);
        let local_public = PublicKey::from(&local_secret);
        Channel {
            local_id,
            peer_id,
            local_secret,
            local_public,
            local_pub_date: now,
            peer_public: None,
            peer_pub_date: 0,
            phase: ChannelPhase::None,
            in_id: None,
            out_id: None,
            decrypt_key: None,
            encrypt_key: None,
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == ChannelPhase::Ready
    }

    pub fn is_inited(&self) -> bool {
        self.phase != ChannelPhase::None
    }

    pub fn in_id(&self) -> Option<[u8; 32]> {
        self.in_id
    }

    pub fn create_channel_message(&self) -> Message {
        Message::CreateChannel {
            key: self.local_public.to_bytes(),
            date: self.local_pub_date,
        }
    }

    pub fn confirm_channel_message(&self) -> Option<Message> {
        let peer_key = self.peer_public?.to_bytes();
        Some(Message::ConfirmChannel {
            key: self.local_public.to_bytes(),
            peer_key,
            date: self.local_pub_date,
        })
    }

    /// Apply the §4.3 key-selection rule for an incoming `CreateChannel`.
    pub fn on_create_channel(&mut self, peer_key: [u8; 32], date: i32) -> ChannelEvent {
        self.apply_peer_key(peer_key, date)
    }

    /// Apply the rule for an incoming `ConfirmChannel`, first checking
    /// the echoed key matches our own advertised ephemeral.
    pub fn on_confirm_channel(&mut self, key: [u8; 32], peer_key_echo: [u8; 32], date: i32) -> ChannelEvent {
        if peer_key_echo != self.local_public.to_bytes() {
            debug!(local_id = %self.local_id, peer_id = %self.peer_id, "channel: confirm echoes a stale key, dropping");
            return ChannelEvent::Rejected;
        }
        let event = self.apply_peer_key(key, date);
        if matches!(event, ChannelEvent::Updated { .. }) {
            self.phase = ChannelPhase::Ready;
        }
        event
    }

    fn apply_peer_key(&mut self, peer_key: [u8; 32], date: i32) -> ChannelEvent {
        if self.phase == ChannelPhase::None {
            self.install(peer_key, date);
            return ChannelEvent::Updated {
                old_in_id: None,
                should_confirm: true,
            };
        }
        let stored = self.peer_public.map(|p| p.to_bytes());
        if stored == Some(peer_key) {
            return ChannelEvent::NoOp;
        }
        if date <= self.peer_pub_date {
            return ChannelEvent::NoOp;
        }
        let old_in_id = self.in_id;
        self.install(peer_key, date);
        ChannelEvent::Updated {
            old_in_id,
            should_confirm: true,
        }
    }

    fn install(&mut self, peer_key: [u8; 32], date: i32) {
        let peer_public = PublicKey::from(peer_key);
        let shared = channel_crypto::dh(&self.local_secret, &peer_public);
        let ChannelKeys { decrypt_key, encrypt_key } =
            channel_crypto::derive_channel_keys(self.local_id, self.peer_id, &shared);
        self.in_id = Some(channel_crypto::channel_short_id(&decrypt_key));
        self.out_id = Some(channel_crypto::channel_short_id(&encrypt_key));
        self.decrypt_key = Some(decrypt_key);
        self.encrypt_key = Some(encrypt_key);
        self.peer_public = Some(peer_public);
        self.peer_pub_date = date;
        if self.phase == ChannelPhase::None {
            self.phase = ChannelPhase::Inited;
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, adnl_core::AdnlError> {
        let key = self.encrypt_key.ok_or_else(|| {
            adnl_core::AdnlError::ProtocolViolation("channel: encrypt before ready".into())
        })?;
        let mut framed = channel_crypto::encrypt(&key, plaintext)?;
        let mut out = Vec::with_capacity(32 + framed.len());
        out.extend_from_slice(&self.out_id.expect("out_id set alongside encrypt_key"));
        out.append(&mut framed);
        Ok(out)
    }

    pub fn decrypt(&self, framed_with_prefix_stripped: &[u8]) -> Result<Vec<u8>, adnl_core::AdnlError> {
        let key = self.decrypt_key.ok_or_else(|| {
            adnl_core::AdnlError::ProtocolViolation("channel: decrypt before ready".into())
        })?;
        channel_crypto::decrypt(&key, framed_with_prefix_stripped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(b: u8) -> ShortNodeId {
        ShortNodeId([b; 32])
    }

    #[test]
    fn handshake_promotes_to_ready_on_both_sides() {
        let a_id = short(1);
        let b_id = short(2);
        let mut a = Channel::new(a_id, b_id, 100);
        let mut b = Channel::new(b_id, a_id, 100);

        // A sends CreateChannel to B.
        let a_create = a.create_channel_message();
        let (a_key, a_date) = match a_create {
            Message::CreateChannel { key, date } => (key, date),
            _ => unreachable!(),
        };
        let ev = b.on_create_channel(a_key, a_date);
        assert!(matches!(ev, ChannelEvent::Updated { .. }));
        assert_eq!(b.phase(), ChannelPhase::Inited);

        // B confirms back to A.
        let b_confirm = b.confirm_channel_message().unwrap();
        let (b_key, b_peer_key, b_date) = match b_confirm {
            Message::ConfirmChannel { key, peer_key, date } => (key, peer_key, date),
            _ => unreachable!(),
        };
        assert_eq!(b_peer_key, a_key);
        let ev = a.on_confirm_channel(b_key, b_peer_key, b_date);
        assert!(matches!(ev, ChannelEvent::Updated { .. }));
        assert_eq!(a.phase(), ChannelPhase::Ready);

        // A's encrypt key must equal B's decrypt key (and vice versa):
        // keys are installed as soon as both ephemeral publics are known,
        // independent of which side has reached `Ready`.
        let msg = b"hello via channel";
        let framed = a.encrypt(msg).unwrap();
        let decrypted = b.decrypt(&framed[32..]).unwrap();
        assert_eq!(decrypted, msg);
    }

    #[test]
    fn confirm_with_wrong_echo_is_rejected() {
        let a_id = short(1);
        let b_id = short(2);
        let mut a = Channel::new(a_id, b_id, 100);
        let bogus_key = [9u8; 32];
        let ev = a.on_confirm_channel([1u8; 32], bogus_key, 100);
        assert!(matches!(ev, ChannelEvent::Rejected));
        assert_eq!(a.phase(), ChannelPhase::None);
    }

    #[test]
    fn stale_create_channel_is_ignored() {
        let a_id = short(1);
        let b_id = short(2);
        let mut b = Channel::new(b_id, a_id, 100);
        let first_key = [4u8; 32];
        let ev = b.on_create_channel(first_key, 200);
        assert!(matches!(ev, ChannelEvent::Updated { .. }));
        let older_key = [5u8; 32];
        let ev = b.on_create_channel(older_key, 150);
        assert!(matches!(ev, ChannelEvent::NoOp));
    }
}
