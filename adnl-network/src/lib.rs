//! ADNL networking actors: sockets, peer/channel state machines, DHT
//! address publication, and the persistence + auxiliary-TCP plumbing
//! around them.
//!
//! Module map
//! ----------
//! • `network_manager` — owns the bound UDP sockets, dispatches inbound
//!   datagrams to `PeerTable::route_inbound`.
//! • `channel` — the per-PeerPair AES channel handshake state machine.
//! • `peer_pair` / `peer` / `peer_table` — per-remote-identity traffic
//!   state, grouped first by local identity then by remote identity.
//! • `local_id` — one hosted identity's own address list + DHT
//!   republication.
//! • `query` — query/answer correlation via oneshot channels.
//! • `subscription` — prefix-ordered `Custom`/`Query` dispatch per `LocalId`.
//! • `dht` — the `DhtHandle` trait plus a null and an in-memory fake.
//! • `db` — persistent peer address-list cache (`sled`-backed or null).
//! • `static_nodes` — config-seeded peers known without a DHT lookup.
//! • `rate_limiter`, `stats`, `time` — small shared building blocks.
//! • `ext_server` — the auxiliary TCP control endpoint (ping/query/answer).
//! • `error` — `NetError`, the actor-level error type.

pub mod channel;
pub mod connection;
pub mod db;
pub mod dht;
pub mod error;
pub mod ext_server;
pub mod local_id;
pub mod network_manager;
pub mod peer;
pub mod peer_pair;
pub mod peer_table;
pub mod query;
pub mod rate_limiter;
pub mod static_nodes;
pub mod stats;
pub mod subscription;
pub mod time;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use adnl_core::Keyring;
use adnl_types::{AddressList, FullNodeId, ShortNodeId};
use tracing::info;

use crate::db::Db;
use crate::dht::DhtHandle;
use crate::local_id::LocalId;
use crate::network_manager::NetworkManager;
use crate::peer_pair::PeerPair;
use crate::peer_table::PeerTable;
use crate::static_nodes::StaticNodes;

/// Base cadence for republishing a hosted identity's address list to the
/// DHT. `LocalId::start_publishing` jitters each tick by ×2/3 to ×4/3
/// around this value, so the actual interval ranges from 60 s to 120 s.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(90);

/// Top-level handle bundling everything one process needs to speak ADNL:
/// the shared `Keyring`, the `NetworkManager` driving sockets, the
/// `PeerTable` doing inbound routing, and the `LocalId`s this process
/// hosts, generalized to many hosted identities and many remote peers.
pub struct AdnlNode {
    pub keyring: Keyring,
    pub network: NetworkManager,
    pub peer_table: Arc<PeerTable>,
    dht: Arc<dyn DhtHandle>,
    db: Arc<dyn Db>,
}

impl AdnlNode {
    pub fn new(
        dht: Arc<dyn DhtHandle>,
        db: Arc<dyn Db>,
        static_nodes: Arc<StaticNodes>,
    ) -> (Self, tokio::sync::mpsc::Receiver<network_manager::InboundDatagram>) {
        let keyring = Keyring::new();
        let (network, inbound_rx) = NetworkManager::new();
        let peer_table = Arc::new(PeerTable::new(
            keyring.clone(),
            network.clone(),
            Arc::clone(&dht),
            static_nodes,
            Arc::clone(&db),
        ));
        let node = AdnlNode {
            keyring,
            network,
            peer_table,
            dht,
            db,
        };
        (node, inbound_rx)
    }

    /// Spawn the task that feeds every inbound datagram into the peer
    /// table's router. Call once after constructing the node.
    pub fn spawn_router(&self, mut inbound_rx: tokio::sync::mpsc::Receiver<network_manager::InboundDatagram>) {
        let peer_table = Arc::clone(&self.peer_table);
        tokio::spawn(async move {
            while let Some(datagram) = inbound_rx.recv().await {
                peer_table.route_inbound(datagram).await;
            }
        });
    }

    /// Generate and host a new local identity, optionally binding a
    /// listening socket and starting periodic DHT republication.
    pub async fn host_identity(
        &self,
        bind_addr: Option<SocketAddr>,
        category: u16,
        reinit_date: i32,
    ) -> Result<Arc<LocalId>, error::NetError> {
        let full_id = self.keyring.generate();
        let local = Arc::new(LocalId::new(full_id, category, self.network.clone(), Arc::clone(&self.dht), reinit_date));
        if let Some(addr) = bind_addr {
            local.listen(addr, category, 0).await?;
        }
        local.start_publishing(DEFAULT_PUBLISH_INTERVAL);
        info!(local_id = %local.short_id(), "adnl node: hosting identity");
        self.peer_table.add_local_id(Arc::clone(&local));
        Ok(local)
    }

    pub fn local_identity(&self, short_id: &ShortNodeId) -> Option<Arc<LocalId>> {
        self.peer_table.local_id(short_id)
    }

    /// Register a remote peer and return the `PeerPair` that carries
    /// traffic for it under the given local identity.
    pub async fn add_peer(
        &self,
        local_id: ShortNodeId,
        peer_full_id: FullNodeId,
        addr_list: Option<AddressList>,
    ) -> Result<Arc<PeerPair>, error::NetError> {
        self.peer_table.add_peer(local_id, peer_full_id, addr_list).await
    }
}
