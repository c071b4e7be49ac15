//! Protocol-level failures.

use thiserror::Error;

/// Errors raised while framing or parsing DAP traffic.
///
/// Per the session contract, any of these closes the connection; the
/// debuggee itself keeps running.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is missing a Content-Length header")]
    MissingContentLength,

    #[error("invalid Content-Length value: {0}")]
    InvalidContentLength(String),

    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { length: usize, limit: usize },
}
