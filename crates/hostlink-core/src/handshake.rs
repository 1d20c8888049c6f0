//! Session handshake: one newline-terminated JSON document each way.
//!
//! The client sends a [`HandshakeRequest`] before any frame; the server
//! answers with exactly one [`HandshakeResponse`]. Frames only follow an
//! accepted response.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest handshake line accepted, newline included.
pub const MAX_HANDSHAKE_LEN: u64 = 64 * 1024;

/// Session request sent by the sandbox-side client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Command name, checked against the whitelist.
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory as seen from inside the sandbox.
    #[serde(default)]
    pub cwd: String,
}

/// Authorization decision for a session. A non-empty `error` means the
/// session was rejected and no process was spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: String,
}

impl HandshakeResponse {
    pub const fn accepted() -> Self {
        Self {
            ok: true,
            error: String::new(),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.ok && self.error.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Connection closed before handshake")]
    Closed,

    #[error("Handshake line exceeds {MAX_HANDSHAKE_LEN} bytes")]
    TooLong,

    #[error("Malformed handshake: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one newline-terminated JSON document.
///
/// The reader must be the same buffered reader used for the frames that
/// follow, since it may already hold bytes past the newline.
pub async fn read_handshake_line<T, R>(reader: &mut R) -> Result<T, HandshakeError>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = reader
        .take(MAX_HANDSHAKE_LEN)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Err(HandshakeError::Closed);
    }
    if line.last() != Some(&b'\n') {
        if u64::try_from(read).unwrap_or(u64::MAX) >= MAX_HANDSHAKE_LEN {
            return Err(HandshakeError::TooLong);
        }
        return Err(HandshakeError::Closed);
    }
    Ok(serde_json::from_slice(&line)?)
}

/// Write one JSON document followed by a newline, then flush.
pub async fn write_handshake_line<T, W>(writer: &mut W, message: &T) -> Result<(), HandshakeError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
