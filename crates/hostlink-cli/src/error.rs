//! Client error types.

use hostlink_core::{FrameError, HandshakeError};

/// Exit status used whenever the host command's own status is unknown.
pub const FALLBACK_EXIT_CODE: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Usage(#[from] clap::Error),

    #[error("HOSTLINK_ADDR is not set")]
    MissingAddr,

    #[error("Cannot connect to hostlink proxy at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("{0}")]
    Rejected(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connection closed before the command reported an exit status")]
    NoExitStatus,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
