use thiserror::Error;

/// Errors raised while encoding/decoding wire records. These are always
/// the root cause behind an `adnl-core::AdnlError::ProtocolViolation` one
/// layer up; kept distinct here because `adnl-types` has no notion of
/// peers, channels or timeouts.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated or malformed wire record")]
    Truncated,
    #[error("unknown TL constructor id {0:#x}")]
    UnknownConstructor(u32),
    #[error("address list serialised to {0} bytes, max is 128")]
    AddressListTooBig(usize),
    #[error("address list has no addresses and does not request reverse ping")]
    EmptyAddressList,
    #[error("message body exceeds the 1 MiB huge-message cap")]
    MessageTooBig,
}
