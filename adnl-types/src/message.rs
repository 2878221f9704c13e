//! `adnl.message.*` wire records.

use crate::error::WireError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Write};

mod ctor {
    pub const CREATE_CHANNEL: u32 = 0xbbc7_70a4;
    pub const CONFIRM_CHANNEL: u32 = 0x6f7e_7b8a;
    pub const CUSTOM: u32 = 0x4b0f_0d7a;
    pub const NOP: u32 = 0x2839_5a95;
    pub const REINIT: u32 = 0x10c2_0520;
    pub const QUERY: u32 = 0x7af9_8bb4;
    pub const ANSWER: u32 = 0x5719_9885;
    pub const PART: u32 = 0x2320_a683;
}

/// One ADNL application-level message. Every `Message` except `Part`
/// counts against the per-message MTU.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    CreateChannel {
        key: [u8; 32],
        date: i32,
    },
    ConfirmChannel {
        /// Our ephemeral key, as the confirming side understands it.
        key: [u8; 32],
        /// Echo of the peer's key we are confirming against.
        peer_key: [u8; 32],
        date: i32,
    },
    Custom {
        data: Vec<u8>,
    },
    Nop,
    Reinit {
        date: i32,
    },
    Query {
        query_id: [u8; 32],
        query: Vec<u8>,
    },
    Answer {
        query_id: [u8; 32],
        answer: Vec<u8>,
    },
    Part {
        hash: [u8; 32],
        total_size: i32,
        offset: i32,
        data: Vec<u8>,
    },
}

impl Message {
    pub fn serialized_size(&self) -> usize {
        match self {
            Message::CreateChannel { .. } => 4 + 32 + 4,
            Message::ConfirmChannel { .. } => 4 + 32 + 32 + 4,
            Message::Custom { data } => 4 + 4 + data.len(),
            Message::Nop => 4,
            Message::Reinit { .. } => 4 + 4,
            Message::Query { query, .. } => 4 + 32 + 4 + query.len(),
            Message::Answer { answer, .. } => 4 + 32 + 4 + answer.len(),
            Message::Part { data, .. } => 4 + 32 + 4 + 4 + 4 + data.len(),
        }
    }

    pub fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        match self {
            Message::CreateChannel { key, date } => {
                w.write_u32::<LittleEndian>(ctor::CREATE_CHANNEL)?;
                w.write_all(key)?;
                w.write_i32::<LittleEndian>(*date)?;
            }
            Message::ConfirmChannel { key, peer_key, date } => {
                w.write_u32::<LittleEndian>(ctor::CONFIRM_CHANNEL)?;
                w.write_all(key)?;
                w.write_all(peer_key)?;
                w.write_i32::<LittleEndian>(*date)?;
            }
            Message::Custom { data } => {
                w.write_u32::<LittleEndian>(ctor::CUSTOM)?;
                write_bytes(w, data)?;
            }
            Message::Nop => {
                w.write_u32::<LittleEndian>(ctor::NOP)?;
            }
            Message::Reinit { date } => {
                w.write_u32::<LittleEndian>(ctor::REINIT)?;
                w.write_i32::<LittleEndian>(*date)?;
            }
            Message::Query { query_id, query } => {
                w.write_u32::<LittleEndian>(ctor::QUERY)?;
                w.write_all(query_id)?;
                write_bytes(w, query)?;
            }
            Message::Answer { query_id, answer } => {
                w.write_u32::<LittleEndian>(ctor::ANSWER)?;
                w.write_all(query_id)?;
                write_bytes(w, answer)?;
            }
            Message::Part {
                hash,
                total_size,
                offset,
                data,
            } => {
                w.write_u32::<LittleEndian>(ctor::PART)?;
                w.write_all(hash)?;
                w.write_i32::<LittleEndian>(*total_size)?;
                w.write_i32::<LittleEndian>(*offset)?;
                write_bytes(w, data)?;
            }
        }
        Ok(())
    }

    pub fn read(r: &mut impl Read) -> Result<Self, WireError> {
        let tag = r.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
        Ok(match tag {
            ctor::CREATE_CHANNEL => {
                let mut key = [0u8; 32];
                r.read_exact(&mut key).map_err(|_| WireError::Truncated)?;
                let date = r.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
                Message::CreateChannel { key, date }
            }
            ctor::CONFIRM_CHANNEL => {
                let mut key = [0u8; 32];
                let mut peer_key = [0u8; 32];
                r.read_exact(&mut key).map_err(|_| WireError::Truncated)?;
                r.read_exact(&mut peer_key).map_err(|_| WireError::Truncated)?;
                let date = r.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
                Message::ConfirmChannel { key, peer_key, date }
            }
            ctor::CUSTOM => Message::Custom {
                data: read_bytes(r)?,
            },
            ctor::NOP => Message::Nop,
            ctor::REINIT => {
                let date = r.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
                Message::Reinit { date }
            }
            ctor::QUERY => {
                let mut query_id = [0u8; 32];
                r.read_exact(&mut query_id).map_err(|_| WireError::Truncated)?;
                Message::Query {
                    query_id,
                    query: read_bytes(r)?,
                }
            }
            ctor::ANSWER => {
                let mut query_id = [0u8; 32];
                r.read_exact(&mut query_id).map_err(|_| WireError::Truncated)?;
                Message::Answer {
                    query_id,
                    answer: read_bytes(r)?,
                }
            }
            ctor::PART => {
                let mut hash = [0u8; 32];
                r.read_exact(&mut hash).map_err(|_| WireError::Truncated)?;
                let total_size = r.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
                let offset = r.read_i32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
                Message::Part {
                    hash,
                    total_size,
                    offset,
                    data: read_bytes(r)?,
                }
            }
            other => return Err(WireError::UnknownConstructor(other)),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        self.write(&mut buf).expect("writing to a Vec is infallible");
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(bytes);
        Self::read(&mut cur)
    }
}

fn write_bytes(w: &mut impl Write, data: &[u8]) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(data.len() as u32)?;
    w.write_all(data)
}

fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, WireError> {
    let len = r.read_u32::<LittleEndian>().map_err(|_| WireError::Truncated)?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(|_| WireError::Truncated)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_each_variant() {
        let msgs = vec![
            Message::CreateChannel {
                key: [1u8; 32],
                date: 42,
            },
            Message::ConfirmChannel {
                key: [2u8; 32],
                peer_key: [3u8; 32],
                date: 43,
            },
            Message::Custom {
                data: b"hello".to_vec(),
            },
            Message::Nop,
            Message::Reinit { date: 7 },
            Message::Query {
                query_id: [4u8; 32],
                query: b"q".to_vec(),
            },
            Message::Answer {
                query_id: [5u8; 32],
                answer: b"a".to_vec(),
            },
            Message::Part {
                hash: [6u8; 32],
                total_size: 100,
                offset: 0,
                data: b"chunk".to_vec(),
            },
        ];
        for m in msgs {
            let bytes = m.to_bytes();
            assert_eq!(bytes.len(), m.serialized_size());
            let back = Message::from_bytes(&bytes).unwrap();
            assert_eq!(m, back);
        }
    }
}
