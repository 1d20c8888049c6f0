//! One proxied command session: handshake, spawn, stdio pumps, exit code.
//!
//! Per accepted connection:
//! 1. read the handshake and authorize it against the [`ExecPolicy`];
//! 2. spawn the command with piped stdio in the confined directory;
//! 3. run the stdout, stderr and input pumps concurrently;
//! 4. once the child has exited and both output pumps have drained, send
//!    exactly one `ExitCode` frame and close.

use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use hostlink_core::frame::{CHUNK_SIZE, read_frame};
use hostlink_core::handshake::{read_handshake_line, write_handshake_line};
use hostlink_core::{
    ExecPolicy, Frame, FrameError, FrameType, FrameWriter, HandshakeRequest, HandshakeResponse,
    PolicyError,
};

use super::error::ProxyError;
use crate::process::{exit_code, spawn_failure_code};

/// Buffered stdin chunks per session before the input pump waits on the child.
const STDIN_QUEUE: usize = 64;

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// An `ExitCode` frame carrying this code was sent.
    Exited(i32),
    /// The handshake was refused; nothing was spawned.
    Rejected(PolicyError),
    /// The client went away before the command finished.
    Disconnected,
}

/// Serve one accepted connection to completion, logging the outcome.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, policy: Arc<ExecPolicy>) {
    let session_id = uuid::Uuid::new_v4();
    let span = info_span!("session", id = %session_id, %peer);
    async move {
        match run_session(stream, &policy).await {
            Ok(SessionEnd::Exited(code)) => info!(exit_code = code, "Session finished"),
            Ok(SessionEnd::Rejected(reason)) => info!(%reason, "Session rejected"),
            Ok(SessionEnd::Disconnected) => warn!("Client disconnected before exit"),
            Err(e) => warn!(error = %e, "Session aborted"),
        }
    }
    .instrument(span)
    .await;
}

/// Drive a session over any bidirectional stream.
pub async fn run_session<S>(stream: S, policy: &ExecPolicy) -> Result<SessionEnd, ProxyError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let request: HandshakeRequest = read_handshake_line(&mut reader).await?;
    debug!(cmd = %request.cmd, args = ?request.args, cwd = %request.cwd, "Handshake received");

    let cwd = match policy.authorize(&request.cmd, &request.cwd) {
        Ok(cwd) => cwd,
        Err(reason) => {
            warn!(cmd = %request.cmd, cwd = %request.cwd, %reason, "Rejecting session");
            write_handshake_line(
                &mut write_half,
                &HandshakeResponse::rejected(reason.to_string()),
            )
            .await?;
            let _ = write_half.shutdown().await;
            return Ok(SessionEnd::Rejected(reason));
        }
    };

    write_handshake_line(&mut write_half, &HandshakeResponse::accepted()).await?;
    let writer = FrameWriter::new(write_half);

    info!(
        cmd = %request.cmd,
        args = ?request.args,
        cwd = %cwd.display(),
        "Spawning host command"
    );
    let mut child = match spawn(&request, &cwd) {
        Ok(child) => child,
        Err(e) => {
            let code = spawn_failure_code(&e);
            warn!(cmd = %request.cmd, error = %e, exit_code = code, "Spawn failed");
            let message = format!("hostlink: failed to start {}: {e}\n", request.cmd);
            writer.send(FrameType::Stderr, message.as_bytes()).await?;
            writer.send_frame(&Frame::exit_code(code)).await?;
            let _ = writer.shutdown().await;
            return Ok(SessionEnd::Exited(code));
        }
    };

    let pid = child.id();
    let stdin = child.stdin.take().ok_or(ProxyError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(ProxyError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(ProxyError::MissingPipe("stderr"))?;

    // Cancelled on a client read error or a failed frame write.
    let broken = CancellationToken::new();

    let stdout_pump = tokio::spawn(pump_output(
        stdout,
        FrameType::Stdout,
        writer.clone(),
        broken.clone(),
    ));
    let stderr_pump = tokio::spawn(pump_output(
        stderr,
        FrameType::Stderr,
        writer.clone(),
        broken.clone(),
    ));
    let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
    let stdin_writer = tokio::spawn(write_stdin(stdin, stdin_rx));
    let input_pump = tokio::spawn(pump_input(reader, stdin_tx, pid, broken.clone()));

    let completed = tokio::select! {
        status = child.wait() => Some(status),
        () = broken.cancelled() => None,
    };
    let status = match completed {
        Some(status) => status?,
        None => {
            warn!(?pid, "Connection lost, killing host command");
            let _ = child.start_kill();
            let _ = child.wait().await;
            for task in [&stdout_pump, &stderr_pump] {
                task.abort();
            }
            input_pump.abort();
            stdin_writer.abort();
            return Ok(SessionEnd::Disconnected);
        }
    };

    // Every Stdout/Stderr frame must be on the wire before ExitCode.
    let drained = tokio::select! {
        results = async { tokio::join!(stdout_pump, stderr_pump) } => {
            matches!(results, (Ok(Ok(())), Ok(Ok(()))))
        }
        () = broken.cancelled() => false,
    };
    input_pump.abort();
    stdin_writer.abort();
    if !drained {
        return Ok(SessionEnd::Disconnected);
    }

    let code = exit_code(status);
    writer.send_frame(&Frame::exit_code(code)).await?;
    let _ = writer.shutdown().await;
    Ok(SessionEnd::Exited(code))
}

fn spawn(request: &HandshakeRequest, cwd: &Path) -> std::io::Result<tokio::process::Child> {
    if !cwd.is_dir() {
        return Err(std::io::Error::other(format!(
            "working directory {} does not exist",
            cwd.display()
        )));
    }
    Command::new(&request.cmd)
        .args(&request.args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Copy one child output pipe into frames until EOF.
async fn pump_output<R, W>(
    mut source: R,
    frame_type: FrameType,
    writer: FrameWriter<W>,
    broken: CancellationToken,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => {
                debug!(?frame_type, error = %e, "Output pipe read failed");
                return Ok(());
            }
        };
        if let Err(e) = writer.send(frame_type, &buf[..n]).await {
            broken.cancel();
            return Err(e);
        }
    }
}

/// Feed queued stdin chunks to the child. Dropping the pipe on return is
/// what delivers EOF to the child.
async fn write_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            debug!(error = %e, "Child stdin closed");
            return;
        }
        if let Err(e) = stdin.flush().await {
            debug!(error = %e, "Child stdin flush failed");
            return;
        }
    }
}

/// Demultiplex client frames into the child's stdin and signals.
///
/// Returning drops `stdin_tx`, which closes the child's stdin. A read error
/// marks the connection broken; a clean EOF does not.
async fn pump_input<R>(
    mut reader: R,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    pid: Option<u32>,
    broken: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut stdin_tx = Some(stdin_tx);
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => match frame.frame_type {
                FrameType::Stdin => {
                    if let Some(tx) = &stdin_tx {
                        if tx.send(frame.payload).await.is_err() {
                            stdin_tx = None;
                        }
                    }
                }
                FrameType::StdinEof => {
                    debug!("Client stdin exhausted");
                    stdin_tx = None;
                }
                FrameType::Signal => match frame.as_i32() {
                    Ok(signo) => deliver_signal(pid, signo),
                    Err(e) => warn!(error = %e, "Bad signal frame"),
                },
                other => warn!(frame_type = ?other, "Ignoring unexpected frame from client"),
            },
            Ok(None) => {
                // A half-closed client still reads output and the exit code,
                // so only the child's stdin is closed here.
                debug!("Client finished sending");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Client read failed");
                broken.cancel();
                return;
            }
        }
    }
}

fn deliver_signal(pid: Option<u32>, signo: i32) {
    let Some(raw_pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let Ok(signal) = Signal::try_from(signo) else {
        warn!(signo, "Ignoring unknown signal number");
        return;
    };
    match kill(Pid::from_raw(raw_pid), signal) {
        Ok(()) => info!(pid = raw_pid, ?signal, "Forwarded signal"),
        Err(e) => warn!(pid = raw_pid, ?signal, error = %e, "Failed to forward signal"),
    }
}
