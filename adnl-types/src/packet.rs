//! `adnl.packetContents` — the unframed, flag-gated record carried inside
//! every ADNL datagram.

use crate::address::AddressList;
use crate::error::WireError;
use crate::message::Message;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

const F_FROM: u32 = 1 << 0;
const F_FROM_SHORT: u32 = 1 << 1;
const F_MESSAGES: u32 = 1 << 3;
const F_ADDR_LIST: u32 = 1 << 4;
const F_PRIORITY_ADDR_LIST: u32 = 1 << 5;
const F_SEQNO: u32 = 1 << 6;
const F_CONFIRM_SEQNO: u32 = 1 << 7;
const F_RECV_ADDR_LIST_VERSION: u32 = 1 << 8;
const F_RECV_PRIORITY_ADDR_LIST_VERSION: u32 = 1 << 9;
const F_REINIT_DATE: u32 = 1 << 10;
const F_DST_REINIT_DATE: u32 = 1 << 11;
const F_SIGNATURE: u32 = 1 << 12;

/// The body of every ADNL datagram, once unwrapped from its envelope
/// (channel AES frame, or direct ECIES-sealed frame).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketContents {
    pub from_full: Option<[u8; 32]>,
    pub from_short: Option<[u8; 32]>,
    pub messages: Vec<Message>,
    pub addr_list: Option<AddressList>,
    pub priority_addr_list: Option<AddressList>,
    pub seqno: Option<u64>,
    pub confirm_seqno: Option<u64>,
    pub recv_addr_list_version: Option<i32>,
    pub recv_priority_addr_list_version: Option<i32>,
    pub reinit_date: Option<i32>,
    pub dst_reinit_date: Option<i32>,
    pub signature: Option<[u8; 64]>,
    pub random_bytes: Vec<u8>,
}

impl PacketContents {
    fn flags(&self) -> u32 {
        let mut f = 0;
        if self.from_full.is_some() {
            f |= F_FROM;
        }
        if self.from_short.is_some() {
            f |= F_FROM_SHORT;
        }
        if !self.messages.is_empty() {
            f |= F_MESSAGES;
        }
        if self.addr_list.is_some() {
            f |= F_ADDR_LIST;
        }
        if self.priority_addr_list.is_some() {
            f |= F_PRIORITY_ADDR_LIST;
        }
        if self.seqno.is_some() {
            f |= F_SEQNO;
        }
        if self.confirm_seqno.is_some() {
            f |= F_CONFIRM_SEQNO;
        }
        if self.recv_addr_list_version.is_some() {
            f |= F_RECV_ADDR_LIST_VERSION;
        }
        if self.recv_priority_addr_list_version.is_some() {
            f |= F_RECV_PRIORITY_ADDR_LIST_VERSION;
        }
        if self.reinit_date.is_some() {
            f |= F_REINIT_DATE;
        }
        if self.dst_reinit_date.is_some() {
            f |= F_DST_REINIT_DATE;
        }
        if self.signature.is_some() {
            f |= F_SIGNATURE;
        }
        f
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let flags = self.flags();
        buf.write_u32::<LittleEndian>(flags).unwrap();
        if let Some(from) = &self.from_full {
            buf.write_all(from).unwrap();
        }
        if let Some(from_short) = &self.from_short {
            buf.write_all(from_short).unwrap();
        }
        if flags & F_MESSAGES != 0 {
            buf.write_u32::<LittleEndian>(self.messages.len() as u32).unwrap();
            for m in &self.messages {
                m.write(&mut buf).unwrap();
            }
        }
        if let Some(al) = &self.addr_list {
            let bytes = al.to_bytes().expect("addr_list already validated on construction");
            buf.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
            buf.write_all(&bytes).unwrap();
        }
        if let Some(al) = &self.priority_addr_list {
            let bytes = al.to_bytes().expect("addr_list already validated on construction");
            buf.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
            buf.write_all(&bytes).unwrap();
        }
        if let Some(s) = self.seqno {
            buf.write_u64::<LittleEndian>(s).unwrap();
        }
        if let Some(s) = self.confirm_seqno {
            buf.write_u64::<LittleEndian>(s).unwrap();
        }
        if let Some(v) = self.recv_addr_list_version {
            buf.write_i32::<LittleEndian>(v).unwrap();
        }
        if let Some(v) = self.recv_priority_addr_list_version {
            buf.write_i32::<LittleEndian>(v).unwrap();
        }
        if let Some(v) = self.reinit_date {
            buf.write_i32::<LittleEndian>(v).unwrap();
        }
        if let Some(v) = self.dst_reinit_date {
            buf.write_i32::<LittleEndian>(v).unwrap();
        }
        if let Some(sig) = &self.signature {
            buf.write_all(sig).unwrap();
        }
        buf.write_u32::<LittleEndian>(self.random_bytes.len() as u32).unwrap();
        buf.write_all(&self.random_bytes).unwrap();
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(bytes);
        let flags = cur.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
        let mut p = PacketContents::default();
        if flags & F_FROM != 0 {
            let mut b = [0u8; 32];
            cur.read_exact(&mut b).map_err(|_| WireError::Truncated)?;
            p.from_full = Some(b);
        }
        if flags & F_FROM_SHORT != 0 {
            let mut b = [0u8; 32];
            cur.read_exact(&mut b).map_err(|_| WireError::Truncated)?;
            p.from_short = Some(b);
        }
        if flags & F_MESSAGES != 0 {
            let count = cur.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
            let mut msgs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                msgs.push(Message::read(&mut cur)?);
            }
            p.messages = msgs;
        }
        if flags & F_ADDR_LIST != 0 {
            let len = cur.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
            let mut b = vec![0u8; len as usize];
            cur.read_exact(&mut b).map_err(|_| WireError::Truncated)?;
            p.addr_list = Some(AddressList::from_bytes(&b)?);
        }
        if flags & F_PRIORITY_ADDR_LIST != 0 {
            let len = cur.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
            let mut b = vec![0u8; len as usize];
            cur.read_exact(&mut b).map_err(|_| WireError::Truncated)?;
            p.priority_addr_list = Some(AddressList::from_bytes(&b)?);
        }
        if flags & F_SEQNO != 0 {
            p.seqno = Some(cur.read_u64::<LittleEndian>().map_err(|_| WireError::Truncated)?);
        }
        if flags & F_CONFIRM_SEQNO != 0 {
            p.confirm_seqno = Some(cur.read_u64::<LittleEndian>().map_err(|_| WireError::Truncated)?);
        }
        if flags & F_RECV_ADDR_LIST_VERSION != 0 {
            p.recv_addr_list_version = Some(cur.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?);
        }
        if flags & F_RECV_PRIORITY_ADDR_LIST_VERSION != 0 {
            p.recv_priority_addr_list_version =
                Some(cur.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?);
        }
        if flags & F_REINIT_DATE != 0 {
            p.reinit_date = Some(cur.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?);
        }
        if flags & F_DST_REINIT_DATE != 0 {
            p.dst_reinit_date = Some(cur.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?);
        }
        if flags & F_SIGNATURE != 0 {
            let mut sig = [0u8; 64];
            cur.read_exact(&mut sig).map_err(|_| WireError::Truncated)?;
            p.signature = Some(sig);
        }
        let rand_len = cur.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
        let mut rand_bytes = vec![0u8; rand_len as usize];
        cur.read_exact(&mut rand_bytes).map_err(|_| WireError::Truncated)?;
        p.random_bytes = rand_bytes;
        Ok(p)
    }

    /// The bytes a signature is computed over: everything except the
    /// `signature` field itself.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_minimal() {
        let p = PacketContents {
            seqno: Some(1),
            confirm_seqno: Some(0),
            random_bytes: vec![0u8; 7],
            ..Default::default()
        };
        let bytes = p.to_bytes();
        let back = PacketContents::from_bytes(&bytes).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn roundtrip_full() {
        let p = PacketContents {
            from_full: Some([1u8; 32]),
            from_short: Some([2u8; 32]),
            messages: vec![Message::Nop, Message::Reinit { date: 5 }],
            addr_list: Some(AddressList::empty_reverse(1, 2)),
            priority_addr_list: None,
            seqno: Some(9),
            confirm_seqno: Some(3),
            recv_addr_list_version: Some(4),
            recv_priority_addr_list_version: None,
            reinit_date: Some(100),
            dst_reinit_date: Some(50),
            signature: Some([7u8; 64]),
            random_bytes: vec![1, 2, 3, 4, 5, 6, 7],
        };
        let bytes = p.to_bytes();
        let back = PacketContents::from_bytes(&bytes).unwrap();
        assert_eq!(p, back);
    }
}
