//! Top-level registry a node keeps for every peer it talks to across
//! every local identity it hosts. Owns inbound routing: a datagram's
//! leading 32 bytes are either a channel id (direct dispatch to the
//! owning `PeerPair`) or a destination short id (decrypt, learn the
//! sender from the packet, then dispatch). Either way, the destination's
//! category must overlap the inbound listener's category mask or the
//! datagram is dropped before it reaches any decryption step.

use std::collections::HashMap;
use std::sync::Arc;

use adnl_core::Keyring;
use adnl_types::{AddressList, FullNodeId, PacketContents, ShortNodeId};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::db::Db;
use crate::dht::DhtHandle;
use crate::local_id::LocalId;
use crate::network_manager::{InboundDatagram, NetworkManager};
use crate::peer::Peer;
use crate::peer_pair::{ChannelRegistry, PeerPair};
use crate::static_nodes::StaticNodes;
use crate::time::AdnlStartTime;

pub struct PeerTable {
    keyring: Keyring,
    network: NetworkManager,
    dht: Arc<dyn DhtHandle>,
    static_nodes: Arc<StaticNodes>,
    db: Arc<dyn Db>,
    start_time: AdnlStartTime,
    local_ids: RwLock<HashMap<ShortNodeId, Arc<LocalId>>>,
    peers: RwLock<HashMap<ShortNodeId, Arc<Peer>>>,
    channel_index: Arc<RwLock<HashMap<[u8; 32], (ShortNodeId, ShortNodeId, u16)>>>,
}

impl PeerTable {
    pub fn new(
        keyring: Keyring,
        network: NetworkManager,
        dht: Arc<dyn DhtHandle>,
        static_nodes: Arc<StaticNodes>,
        db: Arc<dyn Db>,
    ) -> Self {
        PeerTable {
            keyring,
            network,
            dht,
            static_nodes,
            db,
            start_time: AdnlStartTime::now(),
            local_ids: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            channel_index: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a hosted identity so inbound traffic addressed to it can
    /// be routed and outbound pairs can be created for it. `PeerTable`
    /// owns every hosted `LocalId` by its short id.
    pub fn add_local_id(&self, local: Arc<LocalId>) {
        self.local_ids.write().insert(local.short_id(), local);
    }

    pub fn local_id(&self, short_id: &ShortNodeId) -> Option<Arc<LocalId>> {
        self.local_ids.read().get(short_id).cloned()
    }

    pub fn remove_local_id(&self, short_id: &ShortNodeId) {
        self.local_ids.write().remove(short_id);
    }

    /// Register a peer this node already knows the full identity and
    /// (optionally) a cached address for, returning the `PeerPair` ready
    /// to carry traffic for `local_id`.
    pub async fn add_peer(
        &self,
        local_id: ShortNodeId,
        peer_full_id: FullNodeId,
        addr_list: Option<AddressList>,
    ) -> Result<Arc<PeerPair>, crate::error::NetError> {
        let local = self
            .local_id(&local_id)
            .ok_or_else(|| crate::error::NetError::NotReady(format!("no local identity {local_id}")))?;
        let peer_id = peer_full_id.short_id();
        let pair = self.get_or_create_pair(local, peer_id, peer_full_id.clone());

        let resolved_list = match addr_list {
            Some(list) => {
                let item = crate::db::AdnlDbItem {
                    full_id: peer_full_id.to_bytes(),
                    addr_list: list.clone(),
                    priority_addr_list: None,
                };
                if let Err(e) = self.db.put(local_id, peer_id, item).await {
                    warn!(%peer_id, error = %e, "peer table: failed to cache address list");
                }
                Some(list)
            }
            None => self.db.get(local_id, peer_id).await.ok().flatten().map(|item| item.addr_list),
        };
        if let Some(list) = resolved_list {
            pair.adopt_addr_list(list);
        }
        Ok(pair)
    }

    pub fn pair_for(&self, local_id: ShortNodeId, peer_id: ShortNodeId) -> Option<Arc<PeerPair>> {
        self.peers.read().get(&peer_id)?.pair_for(&local_id)
    }

    pub fn remove_peer(&self, local_id: ShortNodeId, peer_id: ShortNodeId) {
        let drop_peer = {
            let peers = self.peers.read();
            let Some(peer) = peers.get(&peer_id) else { return };
            peer.remove_pair(&local_id);
            peer.is_empty()
        };
        if drop_peer {
            self.peers.write().remove(&peer_id);
        }
    }

    /// Entry point for everything `NetworkManager`'s listeners hand up.
    pub async fn route_inbound(&self, datagram: InboundDatagram) {
        if datagram.payload.len() < 32 {
            debug!("peer table: inbound datagram shorter than a routing prefix, dropping");
            return;
        }
        let prefix: [u8; 32] = datagram.payload[..32].try_into().unwrap();
        let body = &datagram.payload[32..];

        let channel_route = self.channel_index.read().get(&prefix).copied();
        if let Some((local_id, peer_id, category)) = channel_route {
            if datagram.category_mask & category == 0 {
                debug!(%local_id, category, mask = datagram.category_mask, "peer table: channel packet's category doesn't match listener, dropping");
                return;
            }
            if let Some(pair) = self.pair_for(local_id, peer_id) {
                if let Err(e) = pair.receive_packet_checked(Some(prefix), body, datagram.src).await {
                    debug!(%peer_id, error = %e, "peer table: channel packet rejected");
                }
            }
            return;
        }

        let local_id = ShortNodeId(prefix);
        let Some(local) = self.local_id(&local_id) else {
            debug!("peer table: inbound datagram for unknown local destination, dropping");
            return;
        };

        if datagram.category_mask & local.category() == 0 {
            debug!(%local_id, category = local.category(), mask = datagram.category_mask, "peer table: direct packet's category doesn't match listener, dropping");
            return;
        }

        let plaintext = match self.keyring.decrypt(&local_id, body) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "peer table: failed to open direct packet");
                return;
            }
        };
        let packet = match PacketContents::from_bytes(&plaintext) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "peer table: malformed direct packet");
                return;
            }
        };
        let Some(from_full_bytes) = packet.from_full else {
            debug!("peer table: direct packet missing sender identity, dropping");
            return;
        };
        let Ok(peer_full) = FullNodeId::from_bytes(&from_full_bytes) else {
            debug!("peer table: direct packet has an invalid sender public key, dropping");
            return;
        };
        let peer_id = peer_full.short_id();

        let pair = self.get_or_create_pair(local, peer_id, peer_full);
        if let Err(e) = pair.receive_packet_checked(None, body, datagram.src).await {
            warn!(%peer_id, error = %e, "peer table: direct packet rejected");
        }
    }

    fn get_or_create_pair(&self, local: Arc<LocalId>, peer_id: ShortNodeId, peer_full_id: FullNodeId) -> Arc<PeerPair> {
        let local_id = local.short_id();
        let peer = {
            let mut peers = self.peers.write();
            peers
                .entry(peer_id)
                .or_insert_with(|| Arc::new(Peer::new(peer_full_id.clone())))
                .clone()
        };
        if let Some(existing) = peer.pair_for(&local_id) {
            return existing;
        }
        let registry = self.make_channel_registry(peer_id);
        let keyring = self.keyring.clone();
        let network = self.network.clone();
        let dht = Arc::clone(&self.dht);
        let static_nodes = Arc::clone(&self.static_nodes);
        let start = self.start_time.get();
        let pair = Arc::new_cyclic(|weak| {
            PeerPair::new(
                weak.clone(),
                local_id,
                local,
                peer_id,
                peer_full_id,
                keyring,
                network,
                dht,
                static_nodes,
                registry,
                start,
            )
        });
        peer.add_pair(local_id, Arc::clone(&pair));
        pair
    }

    fn make_channel_registry(&self, peer_id: ShortNodeId) -> ChannelRegistry {
        let register_index = Arc::clone(&self.channel_index);
        let unregister_index = Arc::clone(&self.channel_index);
        ChannelRegistry {
            register: Arc::new(move |owner_local_id: ShortNodeId, channel_id: [u8; 32], category: u16| {
                register_index.write().insert(channel_id, (owner_local_id, peer_id, category));
            }),
            unregister: Arc::new(move |channel_id: [u8; 32]| {
                unregister_index.write().remove(&channel_id);
            }),
        }
    }
}
