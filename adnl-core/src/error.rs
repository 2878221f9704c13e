use thiserror::Error;

/// The error kinds produced by this crate. Inbound packet errors never
/// reach the peer — they are logged and dropped by the caller — while
/// outbound/query errors are surfaced to whoever made the call.
#[derive(Debug, Error)]
pub enum AdnlError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("query timed out")]
    Timeout,

    #[error("unknown destination short id")]
    UnknownDestination,

    #[error("cancelled")]
    Cancelled,

    #[error("duplicate seqno")]
    Duplicate,

    #[error("stale reinit_date")]
    Stale,

    #[error("no subscription handler for this prefix")]
    NoHandler,

    #[error("message of {0} bytes exceeds the 1 MiB cap")]
    TooBig(usize),

    #[error(transparent)]
    Wire(#[from] adnl_types::WireError),
}
