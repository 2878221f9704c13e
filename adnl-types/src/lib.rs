//! Wire types for the ADNL transport: node identities, addresses, the
//! handful of `adnl.message.*` records, and the `adnl.packetContents`
//! envelope that carries them. No I/O, no actors — just TL-style
//! encode/decode, kept byte-exact per the protocol's frozen constructor
//! ids.

pub mod address;
pub mod constants;
pub mod error;
pub mod message;
pub mod node_id;
pub mod packet;

pub use address::{tunnel_address, Address, AddressList};
pub use error::WireError;
pub use message::Message;
pub use node_id::{FullNodeId, ShortNodeId};
pub use packet::PacketContents;
