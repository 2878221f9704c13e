//! In-memory directory of bootstrap identities and their addresses.

use std::collections::HashMap;
use std::net::IpAddr;

use adnl_types::{Address, AddressList, FullNodeId, ShortNodeId};

#[derive(Clone, Debug)]
pub struct StaticNode {
    pub full_id: FullNodeId,
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Default)]
pub struct StaticNodes {
    nodes: HashMap<ShortNodeId, StaticNode>,
}

impl StaticNodes {
    pub fn new() -> Self {
        StaticNodes::default()
    }

    pub fn add(&mut self, full_id: FullNodeId, ip: IpAddr, port: u16) {
        let short_id = full_id.short_id();
        self.nodes.insert(short_id, StaticNode { full_id, ip, port });
    }

    pub fn get(&self, id: &ShortNodeId) -> Option<&StaticNode> {
        self.nodes.get(id)
    }

    /// Render a static node's configured address as a one-shot
    /// `AddressList`, the shape `PeerPair::discover`'s static-nodes
    /// lookup hands back.
    pub fn addr_list_for(&self, id: &ShortNodeId, reinit_date: i32) -> Option<AddressList> {
        let node = self.nodes.get(id)?;
        let addr = match node.ip {
            IpAddr::V4(ip) => Address::UdpV4 { ip, port: node.port },
            IpAddr::V6(ip) => Address::UdpV6 { ip, port: node.port },
        };
        Some(AddressList {
            addrs: vec![addr],
            version: 0,
            reinit_date,
            priority: 0,
            expire_at: 0,
        })
    }
}
