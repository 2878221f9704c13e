//! One hosted identity's own address list: ownership, versioning, and
//! periodic re-publication to the DHT. Decryption dispatch for inbound
//! traffic addressed to this identity lives in `PeerTable` (it needs the
//! whole-table view to find or create the sending peer); `LocalId` only
//! owns what's specific to *this* identity.

use std::sync::Arc;
use std::time::Duration;

use adnl_types::{Address, AddressList, FullNodeId, ShortNodeId};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dht::{DhtHandle, DhtKey};
use crate::error::NetError;
use crate::network_manager::NetworkManager;
use crate::subscription::{QueryResponder, SubscriptionHandler, SubscriptionTable};
use crate::time::{jittered, unix_time};

struct LocalIdState {
    addrs: Vec<Address>,
    version: i32,
    reinit_date: i32,
    category: u16,
}

/// A node identity this process hosts, plus the bookkeeping needed to
/// keep its `AddressList` current in the DHT.
pub struct LocalId {
    short_id: ShortNodeId,
    full_id: FullNodeId,
    network: NetworkManager,
    dht: Arc<dyn DhtHandle>,
    state: RwLock<LocalIdState>,
    publish_task: RwLock<Option<JoinHandle<()>>>,
    subscriptions: SubscriptionTable,
}

impl LocalId {
    pub fn new(full_id: FullNodeId, category: u16, network: NetworkManager, dht: Arc<dyn DhtHandle>, reinit_date: i32) -> Self {
        let short_id = full_id.short_id();
        LocalId {
            short_id,
            full_id,
            network,
            dht,
            state: RwLock::new(LocalIdState {
                addrs: Vec::new(),
                version: 1,
                reinit_date,
                category,
            }),
            publish_task: RwLock::new(None),
            subscriptions: SubscriptionTable::new(),
        }
    }

    /// Register a handler for messages/queries whose data starts with
    /// `prefix`. Rejects overlapping prefixes.
    pub fn subscribe(&self, prefix: Vec<u8>, handler: SubscriptionHandler) -> Result<(), NetError> {
        self.subscriptions.subscribe(prefix, handler)
    }

    pub fn unsubscribe(&self, prefix: &[u8]) {
        self.subscriptions.unsubscribe(prefix)
    }

    /// Route an inbound `Custom`/`Query` payload to the first matching
    /// subscription. Returns `false` if nothing matched.
    pub fn dispatch(&self, peer_id: ShortNodeId, data: Vec<u8>, responder: Option<QueryResponder>) -> bool {
        self.subscriptions.dispatch(peer_id, data, responder)
    }

    pub fn short_id(&self) -> ShortNodeId {
        self.short_id
    }

    pub fn full_id(&self) -> FullNodeId {
        self.full_id.clone()
    }

    pub fn category(&self) -> u16 {
        self.state.read().category
    }

    /// Bind a listening socket and add its address to this identity's
    /// published list. Every address change bumps the version, which
    /// re-triggers publication.
    pub async fn listen(&self, bind_addr: std::net::SocketAddr, category_mask: u16, priority: u32) -> Result<(), NetError> {
        let local_addr = self.network.add_self_addr(bind_addr, category_mask, priority).await?;
        let addr = match local_addr.ip() {
            std::net::IpAddr::V4(ip) => Address::UdpV4 { ip, port: local_addr.port() },
            std::net::IpAddr::V6(ip) => Address::UdpV6 { ip, port: local_addr.port() },
        };
        let mut state = self.state.write();
        state.addrs.push(addr);
        state.version += 1;
        Ok(())
    }

    pub fn address_list(&self) -> AddressList {
        let state = self.state.read();
        let addrs = if state.addrs.is_empty() {
            vec![Address::Reverse]
        } else {
            state.addrs.clone()
        };
        AddressList {
            addrs,
            version: state.version,
            reinit_date: state.reinit_date,
            priority: 0,
            expire_at: 0,
        }
    }

    /// Push the current address list to the DHT once.
    pub async fn publish(&self) -> Result<(), NetError> {
        let list = self.address_list();
        self.dht.set_value(DhtKey::address(self.short_id), list).await?;
        if !self.dht_has_direct_address() {
            // No direct address to publish: ask the DHT to remember us
            // as reachable only via reverse ping.
            self.dht.register_reverse_connection(self.short_id).await?;
        }
        Ok(())
    }

    fn dht_has_direct_address(&self) -> bool {
        self.state.read().addrs.iter().any(|a| !matches!(a, Address::Reverse))
    }

    /// Start a background task that republishes every `base` interval,
    /// jittered by a factor of ×2/3 to ×4/3 on each tick so peers that
    /// start together don't all hit the DHT in lockstep.
    pub fn start_publishing(self: &Arc<Self>, base: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let lo = base.mul_f64(2.0 / 3.0);
                let hi = base.mul_f64(4.0 / 3.0);
                tokio::time::sleep(jittered(lo, hi)).await;
                if let Err(e) = this.publish().await {
                    warn!(local_id = %this.short_id, error = %e, "local id: periodic dht publish failed");
                } else {
                    info!(local_id = %this.short_id, "local id: published address list");
                }
            }
        });
        if let Some(old) = self.publish_task.write().replace(handle) {
            old.abort();
        }
    }

    pub fn stop_publishing(&self) {
        if let Some(handle) = self.publish_task.write().take() {
            handle.abort();
        }
    }

    pub fn mark_reinit(&self) {
        let mut state = self.state.write();
        state.reinit_date = unix_time();
        state.version += 1;
    }
}

impl Drop for LocalId {
    fn drop(&mut self) {
        self.stop_publishing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adnl_core::Keyring;
    use crate::dht::FakeDht;

    #[test]
    fn address_list_falls_back_to_reverse_when_unbound() {
        let keyring = Keyring::new();
        let full = keyring.generate();
        let (network, _rx) = NetworkManager::new();
        let dht: Arc<dyn DhtHandle> = Arc::new(FakeDht::default());
        let local = LocalId::new(full, 0, network, dht, 1);
        let list = local.address_list();
        assert!(list.has_reverse());
    }
}
