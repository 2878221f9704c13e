//! Prefix-ordered subscription dispatch: a `LocalId` rejects any new
//! prefix that would overlap an existing one, and dispatch picks the
//! one entry a message can ever match. `Custom` messages are delivered
//! one-way; `Query` messages also get a `QueryResponder` the subscriber
//! calls once it has a reply.

use std::sync::Arc;

use adnl_types::ShortNodeId;
use parking_lot::RwLock;

use crate::error::NetError;

/// Call this with the application's answer bytes once a query handler
/// has a reply. Dropping it without calling leaves the querying peer to
/// time out, matching an ordinary one-way-message drop.
pub type QueryResponder = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// `responder` is `Some` only for `Message::Query` deliveries.
pub type SubscriptionHandler = Arc<dyn Fn(ShortNodeId, Vec<u8>, Option<QueryResponder>) + Send + Sync>;

struct Entry {
    prefix: Vec<u8>,
    handler: SubscriptionHandler,
}

/// Ordered-by-registration set of byte-prefix subscriptions for one
/// `LocalId`. No two entries may be a prefix of one another, which
/// guarantees dispatch has at most one match.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: RwLock<Vec<Entry>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        SubscriptionTable::default()
    }

    /// Register `handler` under `prefix`. Rejects `prefix` if it is a
    /// prefix of, or is prefixed by, any existing entry.
    pub fn subscribe(&self, prefix: Vec<u8>, handler: SubscriptionHandler) -> Result<(), NetError> {
        let mut entries = self.entries.write();
        for existing in entries.iter() {
            if existing.prefix.starts_with(&prefix) || prefix.starts_with(&existing.prefix) {
                return Err(NetError::Adnl(adnl_core::AdnlError::ProtocolViolation(format!(
                    "subscription prefix {prefix:?} overlaps an existing subscription"
                ))));
            }
        }
        entries.push(Entry { prefix, handler });
        Ok(())
    }

    pub fn unsubscribe(&self, prefix: &[u8]) {
        self.entries.write().retain(|e| e.prefix != prefix);
    }

    /// Find the (at most one) matching entry and invoke it. Returns
    /// `false` if nothing matched, so the caller can apply the
    /// no-handler policy (drop for one-way, error reply for queries).
    pub fn dispatch(&self, peer_id: ShortNodeId, data: Vec<u8>, responder: Option<QueryResponder>) -> bool {
        let handler = {
            let entries = self.entries.read();
            entries.iter().find(|e| data.starts_with(&e.prefix)).map(|e| e.handler.clone())
        };
        match handler {
            Some(handler) => {
                handler(peer_id, data, responder);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn short(b: u8) -> ShortNodeId {
        ShortNodeId([b; 32])
    }

    #[test]
    fn dispatches_to_the_matching_prefix() {
        let table = SubscriptionTable::new();
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = Arc::clone(&seen);
        table
            .subscribe(b"X".to_vec(), Arc::new(move |_peer, data, _responder| {
                assert_eq!(data, b"X\0data");
                seen2.store(true, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(table.dispatch(short(1), b"X\0data".to_vec(), None));
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn unmatched_prefix_reports_no_match() {
        let table = SubscriptionTable::new();
        table.subscribe(b"X".to_vec(), Arc::new(|_, _, _| {})).unwrap();
        assert!(!table.dispatch(short(1), b"Y".to_vec(), None));
    }

    #[test]
    fn overlapping_prefixes_are_rejected() {
        let table = SubscriptionTable::new();
        table.subscribe(b"foo".to_vec(), Arc::new(|_, _, _| {})).unwrap();
        assert!(table.subscribe(b"foobar".to_vec(), Arc::new(|_, _, _| {})).is_err());
        assert!(table.subscribe(b"f".to_vec(), Arc::new(|_, _, _| {})).is_err());
        assert!(table.subscribe(b"bar".to_vec(), Arc::new(|_, _, _| {})).is_ok());
    }
}
