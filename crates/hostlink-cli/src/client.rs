//! Client half of a proxied command session.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostlink_core::frame::{CHUNK_SIZE, read_frame};
use hostlink_core::handshake::{read_handshake_line, write_handshake_line};
use hostlink_core::{Frame, FrameType, FrameWriter, HandshakeRequest, HandshakeResponse};

use crate::error::ClientError;
use crate::invocation::ClientConfig;
use crate::signals;

pub struct ProxyClient {
    config: ClientConfig,
}

impl ProxyClient {
    pub const fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run against the process's own stdio, forwarding SIGINT and SIGTERM.
    ///
    /// Returns the host command's exit status.
    pub async fn run(&self) -> Result<i32, ClientError> {
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let forwarder = signals::spawn_forwarder(signal_tx)?;
        let result = self
            .run_with_signals(
                tokio::io::stdin(),
                tokio::io::stdout(),
                tokio::io::stderr(),
                signal_rx,
            )
            .await;
        forwarder.abort();
        result
    }

    /// Run against injected streams with no signal forwarding.
    pub async fn run_with<I, O, E>(
        &self,
        stdin: I,
        stdout: O,
        stderr: E,
    ) -> Result<i32, ClientError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let (_no_signals, signal_rx) = mpsc::channel(1);
        self.run_with_signals(stdin, stdout, stderr, signal_rx).await
    }

    /// Run against injected streams; every number received on `signals` is
    /// sent to the host command as a `Signal` frame.
    pub async fn run_with_signals<I, O, E>(
        &self,
        stdin: I,
        mut stdout: O,
        mut stderr: E,
        signals: mpsc::Receiver<i32>,
    ) -> Result<i32, ClientError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let stream = TcpStream::connect(&self.config.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.config.addr.clone(),
                source,
            })?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = HandshakeRequest {
            cmd: self.config.command.clone(),
            args: self.config.args.clone(),
            cwd: self.config.cwd.clone(),
        };
        write_handshake_line(&mut write_half, &request).await?;
        let response: HandshakeResponse = read_handshake_line(&mut reader).await?;
        if !response.is_accepted() {
            info!(cmd = %self.config.command, error = %response.error, "Command rejected by host");
            return Err(ClientError::Rejected(response.error));
        }
        debug!(cmd = %self.config.command, "Session accepted");

        let writer = FrameWriter::new(write_half);
        let done = CancellationToken::new();
        let stdin_pump = tokio::spawn(pump_stdin(stdin, writer.clone(), done.clone()));
        let signal_pump = tokio::spawn(pump_signals(signals, writer.clone(), done.clone()));

        let result = pump_output(&mut reader, &mut stdout, &mut stderr).await;

        done.cancel();
        signal_pump.abort();
        stdin_pump.abort();
        let _ = writer.shutdown().await;
        result
    }
}

/// Write host output to the local streams until the exit status arrives.
async fn pump_output<R, O, E>(
    reader: &mut R,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<i32, ClientError>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    while let Some(frame) = read_frame(reader).await? {
        match frame.frame_type {
            FrameType::Stdout => {
                stdout.write_all(&frame.payload).await?;
                stdout.flush().await?;
            }
            FrameType::Stderr => {
                stderr.write_all(&frame.payload).await?;
                stderr.flush().await?;
            }
            FrameType::ExitCode => {
                let code = frame.as_i32()?;
                debug!(exit_code = code, "Host command exited");
                return Ok(code);
            }
            other => warn!(frame_type = ?other, "Ignoring unexpected frame from host"),
        }
    }
    Err(ClientError::NoExitStatus)
}

/// Forward local stdin in chunks, then mark the end of input.
async fn pump_stdin<I, W>(mut stdin: I, writer: FrameWriter<W>, done: CancellationToken)
where
    I: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            read = stdin.read(&mut buf) => read,
            () = done.cancelled() => return,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.send(FrameType::Stdin, &buf[..n]).await {
                    debug!(error = %e, "Stdin frame not sent");
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "Local stdin read failed, closing host stdin");
                break;
            }
        }
    }
    if let Err(e) = writer.send_frame(&Frame::stdin_eof()).await {
        debug!(error = %e, "StdinEof frame not sent");
    }
}

async fn pump_signals<W>(
    mut signals: mpsc::Receiver<i32>,
    writer: FrameWriter<W>,
    done: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let signo = tokio::select! {
            signo = signals.recv() => match signo {
                Some(signo) => signo,
                None => return,
            },
            () = done.cancelled() => return,
        };
        debug!(signo, "Forwarding signal to host command");
        if writer.send_frame(&Frame::signal(signo)).await.is_err() {
            return;
        }
    }
}
