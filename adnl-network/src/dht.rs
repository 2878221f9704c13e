//! The DHT's interior algorithm is out of scope here; ADNL only needs
//! three operations from it — publish an address list, look one up, and
//! ask for a reverse ping — so the dependency is modeled as a trait
//! object PeerPair/LocalId code can run against, with a no-op
//! implementation for configurations that don't wire up a real DHT.

use adnl_types::{AddressList, ShortNodeId};
use async_trait::async_trait;

use crate::error::NetError;

#[derive(Clone, Debug)]
pub struct DhtKey {
    pub id: ShortNodeId,
    pub name: &'static str,
    pub index: i32,
}

impl DhtKey {
    pub fn address(id: ShortNodeId) -> Self {
        DhtKey {
            id,
            name: "address",
            index: 0,
        }
    }
}

#[async_trait]
pub trait DhtHandle: Send + Sync {
    async fn set_value(&self, key: DhtKey, addr_list: AddressList) -> Result<(), NetError>;
    async fn get_value(&self, key: DhtKey) -> Result<AddressList, NetError>;
    async fn register_reverse_connection(&self, id: ShortNodeId) -> Result<(), NetError>;
    async fn request_reverse_ping(&self, id: ShortNodeId) -> Result<(), NetError>;
}

/// Used when no DHT is configured: every lookup fails with `NotReady`,
/// so callers retry at a jittered interval rather than surfacing an
/// error to the user.
pub struct NullDht;

#[async_trait]
impl DhtHandle for NullDht {
    async fn set_value(&self, _key: DhtKey, _addr_list: AddressList) -> Result<(), NetError> {
        Err(NetError::NotReady("no dht configured".into()))
    }

    async fn get_value(&self, _key: DhtKey) -> Result<AddressList, NetError> {
        Err(NetError::NotReady("no dht configured".into()))
    }

    async fn register_reverse_connection(&self, _id: ShortNodeId) -> Result<(), NetError> {
        Err(NetError::NotReady("no dht configured".into()))
    }

    async fn request_reverse_ping(&self, _id: ShortNodeId) -> Result<(), NetError> {
        Err(NetError::NotReady("no dht configured".into()))
    }
}

/// An in-memory DHT fake for tests: `set_value` simply stores into a
/// map, `get_value` reads from it.
#[derive(Default)]
pub struct FakeDht {
    values: parking_lot::RwLock<std::collections::HashMap<ShortNodeId, AddressList>>,
}

#[async_trait]
impl DhtHandle for FakeDht {
    async fn set_value(&self, key: DhtKey, addr_list: AddressList) -> Result<(), NetError> {
        self.values.write().insert(key.id, addr_list);
        Ok(())
    }

    async fn get_value(&self, key: DhtKey) -> Result<AddressList, NetError> {
        self.values
            .read()
            .get(&key.id)
            .cloned()
            .ok_or_else(|| NetError::NotReady("not found in fake dht".into()))
    }

    async fn register_reverse_connection(&self, _id: ShortNodeId) -> Result<(), NetError> {
        Ok(())
    }

    async fn request_reverse_ping(&self, _id: ShortNodeId) -> Result<(), NetError> {
        Ok(())
    }
}
