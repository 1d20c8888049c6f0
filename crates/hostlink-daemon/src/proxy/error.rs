//! Command proxy error types.

use hostlink_core::{FrameError, HandshakeError};

/// Errors that abort a single proxy session or the server itself.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Child process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("Server task failed: {0}")]
    Task(String),
}
