//! A `Connection` remembers where to send and whether that destination
//! is currently usable. Modeled as a small tagged enum rather than a
//! trait object since the variant set is closed and each arm is tiny.

use std::net::SocketAddr;

use adnl_types::Address;

#[derive(Clone, Debug)]
pub enum Connection {
    /// A plain UDP destination. UDP is connectionless, so "ready" just
    /// means NetworkManager has a socket whose category matches; this is
    /// re-checked lazily rather than tracked as persistent state.
    Udp { addr: SocketAddr },
    /// Routed through another node acting as a tunnel. The tunnel's own
    /// reachability is tracked by its own PeerPair; this variant is a
    /// placeholder until tunnel interior routing is implemented, so it
    /// always reports not-ready (falls through to reverse-ping/DHT
    /// rediscovery per §4.4.5).
    Tunnel { via: SocketAddr },
}

impl Connection {
    pub fn from_address(addr: &Address) -> Option<Connection> {
        match addr {
            Address::UdpV4 { ip, port } => Some(Connection::Udp {
                addr: SocketAddr::new((*ip).into(), *port),
            }),
            Address::UdpV6 { ip, port } => Some(Connection::Udp {
                addr: SocketAddr::new((*ip).into(), *port),
            }),
            Address::Tunnel { .. } => None,
            Address::Reverse => None,
        }
    }

    pub fn ready(&self) -> bool {
        match self {
            Connection::Udp { .. } => true,
            Connection::Tunnel { .. } => false,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Connection::Udp { .. })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            Connection::Udp { addr } => *addr,
            Connection::Tunnel { via } => *via,
        }
    }
}
