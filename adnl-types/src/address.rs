//! `adnl.address.*` and `adnl.addressList` wire records.

use crate::constants::ADDR_LIST_MAX_SIZE;
use crate::error::WireError;
use crate::node_id::FullNodeId;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr};

/// TL constructor ids. Byte-exact layouts, fixed across the wire.
mod ctor {
    pub const UDP: u32 = 0x670d_a6e1;
    pub const UDP6: u32 = 0xe31d_63fa;
    pub const TUNNEL: u32 = 0x3bfb_dd3d;
    /// `AdnlAddressReverse` carries no fields; its serialised size is
    /// still counted as 4 (a reserved tag word).
    pub const REVERSE: u32 = 0x9312_5d02;
    pub const ADDRESS_LIST: u32 = 0xa65e_1198;
}

/// One reachable endpoint for a node identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    UdpV4 { ip: Ipv4Addr, port: u16 },
    UdpV6 { ip: Ipv6Addr, port: u16 },
    Tunnel { to: [u8; 32], pubkey: [u8; 32] },
    /// Node has no direct address and asks peers to request a reverse
    /// ping via the DHT instead.
    Reverse,
}

impl Address {
    pub fn serialized_size(&self) -> u32 {
        match self {
            Address::UdpV4 { .. } => 12,
            Address::UdpV6 { .. } => 20,
            // to:int256 + tagged pubkey (32 bytes raw, no nested TL here —
            // the pubkey constructor tag is folded into TUNNEL's own tag).
            Address::Tunnel { .. } => 64,
            Address::Reverse => 4,
        }
    }

    fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        match self {
            Address::UdpV4 { ip, port } => {
                w.write_u32::<LittleEndian>(ctor::UDP)?;
                w.write_u32::<LittleEndian>(u32::from_be_bytes(ip.octets()))?;
                w.write_u32::<LittleEndian>(*port as u32)?;
            }
            Address::UdpV6 { ip, port } => {
                w.write_u32::<LittleEndian>(ctor::UDP6)?;
                w.write_all(&ip.octets())?;
                w.write_u32::<LittleEndian>(*port as u32)?;
            }
            Address::Tunnel { to, pubkey } => {
                w.write_u32::<LittleEndian>(ctor::TUNNEL)?;
                w.write_all(to)?;
                w.write_all(pubkey)?;
            }
            Address::Reverse => {
                w.write_u32::<LittleEndian>(ctor::REVERSE)?;
            }
        }
        Ok(())
    }

    fn read(r: &mut impl Read) -> Result<Self, WireError> {
        let tag = r.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
        match tag {
            ctor::UDP => {
                let ip = r.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
                let port = r.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
                Ok(Address::UdpV4 {
                    ip: Ipv4Addr::from(ip.to_be_bytes()),
                    port: port as u16,
                })
            }
            ctor::UDP6 => {
                let mut ip = [0u8; 16];
                r.read_exact(&mut ip).map_err(|_| WireError::Truncated)?;
                let port = r.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
                Ok(Address::UdpV6 {
                    ip: Ipv6Addr::from(ip),
                    port: port as u16,
                })
            }
            ctor::TUNNEL => {
                let mut to = [0u8; 32];
                let mut pubkey = [0u8; 32];
                r.read_exact(&mut to).map_err(|_| WireError::Truncated)?;
                r.read_exact(&mut pubkey).map_err(|_| WireError::Truncated)?;
                Ok(Address::Tunnel { to, pubkey })
            }
            ctor::REVERSE => Ok(Address::Reverse),
            other => Err(WireError::UnknownConstructor(other)),
        }
    }
}

/// Versioned, expiring set of reachable endpoints for a node identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressList {
    pub addrs: Vec<Address>,
    pub version: i32,
    pub reinit_date: i32,
    pub priority: i32,
    pub expire_at: i32,
}

impl AddressList {
    pub fn empty_reverse(version: i32, reinit_date: i32) -> Self {
        AddressList {
            addrs: vec![Address::Reverse],
            version,
            reinit_date,
            priority: 0,
            expire_at: 0,
        }
    }

    pub fn has_reverse(&self) -> bool {
        self.addrs.iter().any(|a| matches!(a, Address::Reverse))
    }

    /// `addrs` may be empty only when `has_reverse` is set.
    pub fn is_well_formed(&self) -> bool {
        !self.addrs.is_empty() || self.has_reverse()
    }

    pub fn is_expired(&self, now: i32) -> bool {
        self.expire_at != 0 && self.expire_at <= now
    }

    fn write_body(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(ctor::ADDRESS_LIST)?;
        w.write_u32::<LittleEndian>(self.addrs.len() as u32)?;
        for a in &self.addrs {
            a.write(w)?;
        }
        w.write_i32::<LittleEndian>(self.version)?;
        w.write_i32::<LittleEndian>(self.reinit_date)?;
        w.write_i32::<LittleEndian>(self.priority)?;
        w.write_i32::<LittleEndian>(self.expire_at)?;
        Ok(())
    }

    /// Serialise, rejecting the result if it exceeds the 128-byte cap.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        if !self.is_well_formed() {
            return Err(WireError::EmptyAddressList);
        }
        let mut buf = Vec::new();
        self.write_body(&mut buf).map_err(|_| WireError::Truncated)?;
        if buf.len() > ADDR_LIST_MAX_SIZE {
            return Err(WireError::AddressListTooBig(buf.len()));
        }
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > ADDR_LIST_MAX_SIZE {
            return Err(WireError::AddressListTooBig(bytes.len()));
        }
        let mut cur = Cursor::new(bytes);
        let tag = cur.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
        if tag != ctor::ADDRESS_LIST {
            return Err(WireError::UnknownConstructor(tag));
        }
        let count = cur.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
        let mut addrs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            addrs.push(Address::read(&mut cur)?);
        }
        let version = cur.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
        let reinit_date = cur.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
        let priority = cur.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
        let expire_at = cur.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
        let list = AddressList {
            addrs,
            version,
            reinit_date,
            priority,
            expire_at,
        };
        if !list.is_well_formed() {
            return Err(WireError::EmptyAddressList);
        }
        Ok(list)
    }
}

/// Tunnel addresses embed a peer identity; this helper lets callers build
/// one from a `FullNodeId` without juggling raw bytes at call sites.
pub fn tunnel_address(to: [u8; 32], pubkey: &FullNodeId) -> Address {
    Address::Tunnel {
        to,
        pubkey: pubkey.to_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_udp() {
        let list = AddressList {
            addrs: vec![Address::UdpV4 {
                ip: Ipv4Addr::new(1, 2, 3, 4),
                port: 30303,
            }],
            version: 1,
            reinit_date: 100,
            priority: 0,
            expire_at: 0,
        };
        let bytes = list.to_bytes().unwrap();
        assert!(bytes.len() <= ADDR_LIST_MAX_SIZE);
        let back = AddressList::from_bytes(&bytes).unwrap();
        assert_eq!(list, back);
    }

    #[test]
    fn empty_without_reverse_is_rejected() {
        let list = AddressList {
            addrs: vec![],
            version: 1,
            reinit_date: 1,
            priority: 0,
            expire_at: 0,
        };
        assert!(list.to_bytes().is_err());
    }

    #[test]
    fn empty_with_reverse_is_allowed() {
        let list = AddressList::empty_reverse(1, 1);
        assert!(list.has_reverse());
        let bytes = list.to_bytes().unwrap();
        let back = AddressList::from_bytes(&bytes).unwrap();
        assert_eq!(list, back);
    }

    #[test]
    fn oversized_address_list_rejected() {
        let addrs = (0..10)
            .map(|i| Address::Tunnel {
                to: [i as u8; 32],
                pubkey: [i as u8; 32],
            })
            .collect();
        let list = AddressList {
            addrs,
            version: 1,
            reinit_date: 1,
            priority: 0,
            expire_at: 0,
        };
        assert!(matches!(
            list.to_bytes(),
            Err(WireError::AddressListTooBig(_))
        ));
    }
}
