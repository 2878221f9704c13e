//! Optional `(local_short_id, peer_short_id) -> {full_id, addr_list,
//! priority_addr_list}` cache. Absence is valid; no durability guarantee
//! is required, so a missing `db_root` simply wires up `NullDb` instead
//! of `SledDb`.

use adnl_types::{AddressList, ShortNodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::NetError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdnlDbItem {
    pub full_id: [u8; 32],
    pub addr_list: AddressList,
    pub priority_addr_list: Option<AddressList>,
}

#[async_trait]
pub trait Db: Send + Sync {
    async fn get(&self, local: ShortNodeId, peer: ShortNodeId) -> Result<Option<AdnlDbItem>, NetError>;
    async fn put(&self, local: ShortNodeId, peer: ShortNodeId, item: AdnlDbItem) -> Result<(), NetError>;
}

fn key(local: ShortNodeId, peer: ShortNodeId) -> [u8; 64] {
    let mut k = [0u8; 64];
    k[..32].copy_from_slice(local.as_bytes());
    k[32..].copy_from_slice(peer.as_bytes());
    k
}

/// `db_root` unset: every lookup is a clean miss, every write a no-op.
pub struct NullDb;

#[async_trait]
impl Db for NullDb {
    async fn get(&self, _local: ShortNodeId, _peer: ShortNodeId) -> Result<Option<AdnlDbItem>, NetError> {
        Ok(None)
    }

    async fn put(&self, _local: ShortNodeId, _peer: ShortNodeId, _item: AdnlDbItem) -> Result<(), NetError> {
        Ok(())
    }
}

/// `sled`-backed cache used when config provides `db_root`. Writes are
/// serialised per `(local, peer)` key by virtue of `sled::Tree`'s own
/// internal locking.
pub struct SledDb {
    tree: sled::Tree,
}

impl SledDb {
    pub fn open(root: &Path) -> Result<Self, NetError> {
        let db = sled::open(root).map_err(|e| NetError::Db(e.to_string()))?;
        let tree = db
            .open_tree("adnl_addr_cache")
            .map_err(|e| NetError::Db(e.to_string()))?;
        Ok(SledDb { tree })
    }
}

#[async_trait]
impl Db for SledDb {
    async fn get(&self, local: ShortNodeId, peer: ShortNodeId) -> Result<Option<AdnlDbItem>, NetError> {
        let k = key(local, peer);
        match self.tree.get(k).map_err(|e| NetError::Db(e.to_string()))? {
            Some(bytes) => {
                let item = bincode::deserialize(&bytes).map_err(|e| NetError::Db(e.to_string()))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, local: ShortNodeId, peer: ShortNodeId, item: AdnlDbItem) -> Result<(), NetError> {
        let k = key(local, peer);
        let bytes = bincode::serialize(&item).map_err(|e| NetError::Db(e.to_string()))?;
        self.tree.insert(k, bytes).map_err(|e| NetError::Db(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adnl_types::Address;

    #[tokio::test]
    async fn sled_db_roundtrip() {
        let dir = tempfile_dir();
        let db = SledDb::open(&dir).unwrap();
        let local = ShortNodeId([1u8; 32]);
        let peer = ShortNodeId([2u8; 32]);
        let item = AdnlDbItem {
            full_id: [3u8; 32],
            addr_list: AddressList {
                addrs: vec![Address::UdpV4 {
                    ip: "1.2.3.4".parse().unwrap(),
                    port: 1234,
                }],
                version: 1,
                reinit_date: 1,
                priority: 0,
                expire_at: 0,
            },
            priority_addr_list: None,
        };
        db.put(local, peer, item.clone()).await.unwrap();
        let back = db.get(local, peer).await.unwrap().unwrap();
        assert_eq!(back.full_id, item.full_id);
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("adnl-db-test-{}", rand::random::<u64>()));
        dir
    }
}
