//! Groups every `PeerPair` this process maintains towards one remote
//! identity, across all local identities talking to it. Most deployments
//! run a single `LocalId`, so in practice a `Peer` usually wraps exactly
//! one `PeerPair`; the indirection exists for multi-identity nodes.

use std::collections::HashMap;
use std::sync::Arc;

use adnl_types::{FullNodeId, ShortNodeId};
use parking_lot::RwLock;

use crate::peer_pair::PeerPair;

/// All `PeerPair`s (one per local identity) talking to a single remote
/// node.
pub struct Peer {
    full_id: FullNodeId,
    pairs: RwLock<HashMap<ShortNodeId, Arc<PeerPair>>>,
}

impl Peer {
    pub fn new(full_id: FullNodeId) -> Self {
        Peer {
            full_id,
            pairs: RwLock::new(HashMap::new()),
        }
    }

    pub fn full_id(&self) -> FullNodeId {
        self.full_id.clone()
    }

    pub fn short_id(&self) -> ShortNodeId {
        self.full_id.short_id()
    }

    pub fn add_pair(&self, local_id: ShortNodeId, pair: Arc<PeerPair>) {
        self.pairs.write().insert(local_id, pair);
    }

    pub fn pair_for(&self, local_id: &ShortNodeId) -> Option<Arc<PeerPair>> {
        self.pairs.read().get(local_id).cloned()
    }

    pub fn remove_pair(&self, local_id: &ShortNodeId) -> Option<Arc<PeerPair>> {
        self.pairs.write().remove(local_id)
    }

    pub fn all_pairs(&self) -> Vec<Arc<PeerPair>> {
        self.pairs.read().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adnl_core::Keyring;

    #[test]
    fn tracks_pairs_per_local_id() {
        let keyring = Keyring::new();
        let full = keyring.generate();
        let expected_bytes = full.to_bytes();
        let peer = Peer::new(full);
        assert!(peer.is_empty());
        assert_eq!(peer.full_id().to_bytes(), expected_bytes);
    }
}
