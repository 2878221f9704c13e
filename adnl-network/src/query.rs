//! Outbound query correlation table. Each query gets a fresh random
//! 256-bit id; the table resolves the matching `Answer` or times out
//! and resolves with an error, whichever comes first.

use std::collections::HashMap;
use std::time::Duration;

use adnl_core::AdnlError;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::NetError;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

struct PendingQuery {
    reply_tx: oneshot::Sender<Result<Vec<u8>, AdnlError>>,
}

/// Tracks in-flight queries for one `PeerPair`. Cheap to share: wraps a
/// `Mutex<HashMap<..>>` the same way `Keyring` wraps its entry map.
#[derive(Default)]
pub struct QueryTable {
    pending: Mutex<HashMap<[u8; 32], PendingQuery>>,
}

impl QueryTable {
    pub fn new() -> Self {
        QueryTable::default()
    }

    /// Allocate a fresh query id, register it, and return the id plus a
    /// future that resolves on `resolve()` or times out after `timeout`.
    pub fn start<'a>(
        &'a self,
        timeout: Duration,
    ) -> ([u8; 32], impl std::future::Future<Output = Result<Vec<u8>, NetError>> + 'a) {
        let mut query_id = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut query_id);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(query_id, PendingQuery { reply_tx: tx });
        let fut = async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(Ok(answer))) => Ok(answer),
                Ok(Ok(Err(e))) => Err(NetError::Adnl(e)),
                Ok(Err(_)) => Err(NetError::Cancelled),
                Err(_) => {
                    // The timer fired first: erase our own entry so a
                    // late `Answer` falls through as an unknown query id
                    // instead of matching a promise nobody is awaiting.
                    self.cancel(&query_id);
                    Err(NetError::Timeout)
                }
            }
        };
        (query_id, fut)
    }

    /// Feed in an `Answer` message's resolved payload (or a no-handler /
    /// malformed-tag error). Returns `true` if it matched a pending query
    /// (caller should not forward it further).
    pub fn resolve(&self, query_id: [u8; 32], answer: Result<Vec<u8>, AdnlError>) -> bool {
        let pending = self.pending.lock().remove(&query_id);
        match pending {
            Some(PendingQuery { reply_tx }) => {
                if reply_tx.send(answer).is_err() {
                    debug!("query table: answer arrived after caller gave up waiting");
                }
                true
            }
            None => {
                warn!("query table: answer for unknown or already-resolved query id");
                false
            }
        }
    }

    /// Drop a query's entry without resolving it (used when a send
    /// attempt fails outright and there's no point waiting).
    pub fn cancel(&self, query_id: &[u8; 32]) {
        self.pending.lock().remove(query_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_on_matching_answer() {
        let table = QueryTable::new();
        let (id, fut) = table.start(Duration::from_secs(1));
        assert!(table.resolve(id, Ok(b"pong".to_vec())));
        let answer = fut.await.unwrap();
        assert_eq!(answer, b"pong");
    }

    #[tokio::test]
    async fn resolves_with_no_handler_error() {
        let table = QueryTable::new();
        let (id, fut) = table.start(Duration::from_secs(1));
        assert!(table.resolve(id, Err(AdnlError::NoHandler)));
        let err = fut.await.unwrap_err();
        assert!(matches!(err, NetError::Adnl(AdnlError::NoHandler)));
    }

    #[tokio::test]
    async fn times_out_without_answer() {
        let table = QueryTable::new();
        let (_id, fut) = table.start(Duration::from_millis(20));
        let err = fut.await.unwrap_err();
        assert!(matches!(err, NetError::Timeout));
    }

    #[tokio::test]
    async fn unknown_answer_id_is_rejected() {
        let table = QueryTable::new();
        assert!(!table.resolve([7u8; 32], Ok(b"nope".to_vec())));
    }
}
