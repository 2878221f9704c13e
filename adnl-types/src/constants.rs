//! Wire-level size limits. These are hard protocol constants, not
//! tuning knobs.

/// Per-message MTU: a single `Message` (outside of a `Part`) must
/// serialise to no more than this many bytes, or it gets fragmented.
pub const MESSAGE_MTU: usize = 1312;

/// Network MTU: the hard cap on one outbound UDP datagram's payload.
pub const NETWORK_MTU: usize = 1440;

/// Max total size of a reassembled "huge" (fragmented) message.
pub const HUGE_PACKET_MAX_SIZE: usize = 1 << 20; // 1 MiB

/// Max serialised size of an `AddressList`.
pub const ADDR_LIST_MAX_SIZE: usize = 128;

/// Header budget reserved on a non-channel (handshake) packet.
pub const PACKET_HEADER_MAX_SIZE: u32 = 272;

/// Header budget reserved on a channel-encrypted packet.
pub const CHANNEL_PACKET_HEADER_MAX_SIZE: u32 = 128;

/// Sliding receive window width, in sequence numbers.
pub const SEQNO_WINDOW: u64 = 64;

/// Rate limiter bucket used while no channel is ready.
pub const NOCHANNEL_RATE_LIMIT_MAX: f64 = 50.0;
pub const NOCHANNEL_RATE_LIMIT_PERIOD_SECS: f64 = 0.5;

/// TTL for queued outbound messages, from enqueue.
pub const QUEUE_MESSAGE_TTL_SECS: f64 = 10.0;
