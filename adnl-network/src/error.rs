use thiserror::Error;

/// Errors surfaced by the actor runtime. Wraps `adnl_core::AdnlError`
/// (wire/crypto failures) plus the I/O-shaped failures particular to
/// running real sockets and a persistence backend.
#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Adnl(#[from] adnl_core::AdnlError),

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Db(String),

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}
