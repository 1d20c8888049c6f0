//! Length-prefixed frame codec for the command proxy wire protocol.
//!
//! Every frame is `[1-byte type][4-byte big-endian length][payload]`.
//! `ExitCode` and `Signal` carry a 4-byte big-endian integer, `StdinEof`
//! is always empty.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 5;

/// Read size used by every stdio pump.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Upper bound on a single payload. Pumps never produce more than
/// [`CHUNK_SIZE`], so anything larger is a corrupt or hostile stream.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Frame type codes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Client -> server: bytes for the child's stdin.
    Stdin = 0,
    /// Server -> client: bytes the child wrote to stdout.
    Stdout = 1,
    /// Server -> client: bytes the child wrote to stderr.
    Stderr = 2,
    /// Server -> client: terminal frame carrying the exit status.
    ExitCode = 3,
    /// Client -> server: signal number to deliver to the child.
    Signal = 4,
    /// Client -> server: local stdin is exhausted.
    StdinEof = 5,
}

impl FrameType {
    /// All frame types in wire-code order.
    pub const ALL: [Self; 6] = [
        Self::Stdin,
        Self::Stdout,
        Self::Stderr,
        Self::ExitCode,
        Self::Signal,
        Self::StdinEof,
    ];

    /// Wire code of this frame type.
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            3 => Ok(Self::ExitCode),
            4 => Ok(Self::Signal),
            5 => Ok(Self::StdinEof),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Terminal frame carrying a process exit status.
    pub fn exit_code(code: i32) -> Self {
        Self::new(FrameType::ExitCode, code.to_be_bytes())
    }

    /// Signal frame carrying a raw signal number.
    pub fn signal(signo: i32) -> Self {
        Self::new(FrameType::Signal, signo.to_be_bytes())
    }

    pub fn stdin_eof() -> Self {
        Self::new(FrameType::StdinEof, Vec::new())
    }

    /// Decode the 4-byte big-endian integer carried by `ExitCode` and
    /// `Signal` frames.
    pub fn as_i32(&self) -> Result<i32, FrameError> {
        let bytes: [u8; 4] =
            self.payload
                .as_slice()
                .try_into()
                .map_err(|_| FrameError::BadIntPayload {
                    len: self.payload.len(),
                })?;
        Ok(i32::from_be_bytes(bytes))
    }
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Unknown frame type: {0}")]
    UnknownType(u8),

    #[error("Stream truncated inside a frame ({read} of {expected} bytes)")]
    Truncated { read: usize, expected: usize },

    #[error("Frame payload too large: {len} bytes (max {MAX_PAYLOAD_LEN})")]
    Oversized { len: usize },

    #[error("Integer frame payload must be 4 bytes, got {len}")]
    BadIntPayload { len: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one frame and flush.
///
/// On error the stream is left in an undefined state; the caller must
/// abandon the connection.
pub async fn write_frame<W>(
    writer: &mut W,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::Oversized { len: payload.len() });
    }
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::Oversized {
        len: payload.len(),
    })?;
    let mut header = [0u8; HEADER_LEN];
    header[0] = frame_type.code();
    header[1..].copy_from_slice(&len.to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary and
/// [`FrameError::Truncated`] when it ends anywhere inside a frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let read = read_full(reader, &mut header).await?;
    if read == 0 {
        return Ok(None);
    }
    if read < HEADER_LEN {
        return Err(FrameError::Truncated {
            read,
            expected: HEADER_LEN,
        });
    }

    let frame_type = FrameType::try_from(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let len = usize::try_from(len).map_err(|_| FrameError::Oversized { len: usize::MAX })?;
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::Oversized { len });
    }

    let mut payload = vec![0u8; len];
    let read = read_full(reader, &mut payload).await?;
    if read < len {
        return Err(FrameError::Truncated {
            read,
            expected: len,
        });
    }

    Ok(Some(Frame {
        frame_type,
        payload,
    }))
}

/// Fill `buf` unless the stream ends first; returns the number of bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Shared, serialised frame writer.
///
/// Several pump tasks write to one connection; the mutex keeps each frame's
/// header and payload contiguous. Writes are awaited, so a slow peer stalls
/// the writers instead of growing a buffer.
pub struct FrameWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for FrameWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn send(&self, frame_type: FrameType, payload: &[u8]) -> Result<(), FrameError> {
        let mut writer = self.inner.lock().await;
        write_frame(&mut *writer, frame_type, payload).await
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), FrameError> {
        self.send(frame.frame_type, &frame.payload).await
    }

    /// Shut down the write side of the underlying stream.
    pub async fn shutdown(&self) -> std::io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}
