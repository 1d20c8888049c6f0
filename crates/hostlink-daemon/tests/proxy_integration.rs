#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end tests for the command proxy over real TCP connections.
//!
//! Each test starts a `ProxyServer` on an ephemeral port, speaks the wire
//! protocol directly (handshake line, then frames) and checks what the
//! sandbox side would observe.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use hostlink_core::frame::{read_frame, write_frame};
use hostlink_core::handshake::{read_handshake_line, write_handshake_line};
use hostlink_core::{
    Confinement, ExecPolicy, Frame, FrameType, HandshakeRequest, HandshakeResponse, Whitelist,
};
use hostlink_daemon::proxy::{ProxyServer, ProxyServerHandle};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

async fn start_proxy(root: &std::path::Path, allowed: &[&str]) -> ProxyServerHandle {
    let policy = ExecPolicy::new(
        Whitelist::new(allowed.iter().copied()),
        Confinement::new(root).unwrap(),
    );
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    ProxyServer::start(addr, policy).await.unwrap()
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Collected output of a finished session.
#[derive(Debug, Default)]
struct Transcript {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
}

impl Session {
    async fn open(port: u16, cmd: &str, args: &[&str], cwd: &str) -> (Self, HandshakeResponse) {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let request = HandshakeRequest {
            cmd: cmd.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            cwd: cwd.to_string(),
        };
        write_handshake_line(&mut writer, &request).await.unwrap();
        let mut reader = BufReader::new(read_half);
        let response: HandshakeResponse = read_handshake_line(&mut reader).await.unwrap();
        (Self { reader, writer }, response)
    }

    async fn accepted(port: u16, cmd: &str, args: &[&str]) -> Self {
        let (session, response) = Self::open(port, cmd, args, "/workspace").await;
        assert!(response.is_accepted(), "rejected: {}", response.error);
        session
    }

    async fn send(&mut self, frame_type: FrameType, payload: &[u8]) {
        write_frame(&mut self.writer, frame_type, payload).await.unwrap();
    }

    async fn next(&mut self) -> Option<Frame> {
        read_frame(&mut self.reader).await.unwrap()
    }

    /// Read frames until `ExitCode` or EOF.
    async fn finish(mut self) -> Transcript {
        let mut transcript = Transcript::default();
        tokio::time::timeout(TEST_TIMEOUT, async {
            while let Some(frame) = self.next().await {
                match frame.frame_type {
                    FrameType::Stdout => transcript.stdout.extend(frame.payload),
                    FrameType::Stderr => transcript.stderr.extend(frame.payload),
                    FrameType::ExitCode => {
                        transcript.exit_code = Some(frame.as_i32().unwrap());
                        // ExitCode is the last frame of a session.
                        assert!(self.next().await.is_none());
                        break;
                    }
                    other => panic!("unexpected frame from server: {other:?}"),
                }
            }
        })
        .await
        .unwrap();
        transcript
    }
}

#[tokio::test]
async fn exit_codes_propagate() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["sh"]).await;

    for code in [0, 1, 2, 127, 255] {
        let session = Session::accepted(proxy.port(), "sh", &["-c", &format!("exit {code}")]).await;
        let transcript = session.finish().await;
        assert_eq!(transcript.exit_code, Some(code), "exit {code}");
    }
    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn output_streams_arrive_before_exit_code() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["sh"]).await;

    let session = Session::accepted(
        proxy.port(),
        "sh",
        &["-c", "echo out; echo err >&2; exit 3"],
    )
    .await;
    let transcript = session.finish().await;
    assert_eq!(transcript.stdout, b"out\n");
    assert_eq!(transcript.stderr, b"err\n");
    assert_eq!(transcript.exit_code, Some(3));
}

#[tokio::test]
async fn stdin_is_relayed_to_cat() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["cat"]).await;

    let mut session = Session::accepted(proxy.port(), "cat", &[]).await;
    session.send(FrameType::Stdin, b"hello ").await;
    session.send(FrameType::Stdin, b"world\n").await;
    session.send(FrameType::StdinEof, &[]).await;

    let transcript = session.finish().await;
    assert_eq!(transcript.stdout, b"hello world\n");
    assert_eq!(transcript.exit_code, Some(0));
}

#[tokio::test]
async fn large_stdout_is_chunked_and_complete() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["head"]).await;

    let session = Session::accepted(proxy.port(), "head", &["-c", "200000", "/dev/zero"]).await;
    let transcript = session.finish().await;
    assert_eq!(transcript.stdout.len(), 200_000);
    assert_eq!(transcript.exit_code, Some(0));
}

#[tokio::test]
async fn non_whitelisted_command_is_rejected_without_spawning() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["echo"]).await;

    let (mut session, response) =
        Session::open(proxy.port(), "touch", &["marker"], "/workspace").await;
    assert!(!response.ok);
    assert!(response.error.contains("touch"));
    assert!(session.next().await.is_none());
    assert!(!dir.path().join("marker").exists());
}

#[tokio::test]
async fn escaping_cwd_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["pwd"]).await;

    let (mut session, response) =
        Session::open(proxy.port(), "pwd", &[], "/workspace/../../etc").await;
    assert!(!response.ok);
    assert!(!response.error.is_empty());
    assert!(session.next().await.is_none());
}

#[tokio::test]
async fn cwd_is_translated_into_worktree() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
    let proxy = start_proxy(dir.path(), &["pwd"]).await;

    let (session, response) =
        Session::open(proxy.port(), "pwd", &[], "/workspace/src/nested").await;
    assert!(response.is_accepted());
    let transcript = session.finish().await;
    let expected = format!("{}\n", dir.path().join("src/nested").display());
    assert_eq!(String::from_utf8(transcript.stdout).unwrap(), expected);
}

#[tokio::test]
async fn spawn_failure_reports_127() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["hostlink-no-such-binary"]).await;

    let session = Session::accepted(proxy.port(), "hostlink-no-such-binary", &[]).await;
    let transcript = session.finish().await;
    assert_eq!(transcript.exit_code, Some(127));
    assert!(!transcript.stderr.is_empty());
}

#[tokio::test]
async fn signal_frame_reaches_the_child() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["sleep"]).await;

    let mut session = Session::accepted(proxy.port(), "sleep", &["30"]).await;
    session.send(FrameType::Signal, &15i32.to_be_bytes()).await;

    let transcript = session.finish().await;
    assert_eq!(transcript.exit_code, Some(128 + 15));
}

#[tokio::test]
async fn sessions_are_independent() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["cat", "echo"]).await;

    // A long-lived session stays open while another one completes.
    let mut waiting = Session::accepted(proxy.port(), "cat", &[]).await;
    waiting.send(FrameType::Stdin, b"first\n").await;

    let quick = Session::accepted(proxy.port(), "echo", &["second"]).await;
    let quick = quick.finish().await;
    assert_eq!(quick.stdout, b"second\n");
    assert_eq!(quick.exit_code, Some(0));

    waiting.send(FrameType::StdinEof, &[]).await;
    let waiting = waiting.finish().await;
    assert_eq!(waiting.stdout, b"first\n");
    assert_eq!(waiting.exit_code, Some(0));
}

#[tokio::test]
async fn concurrent_sessions_get_their_own_exit_codes() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["sh"]).await;
    let port = proxy.port();

    let sessions: Vec<_> = (0..6)
        .map(|i| {
            tokio::spawn(async move {
                let script = format!("sleep 0.{i}; echo session-{i}; exit {}", 10 + i);
                Session::accepted(port, "sh", &["-c", &script]).await.finish().await
            })
        })
        .collect();
    for (i, session) in (0..).zip(sessions) {
        let transcript = session.await.unwrap();
        assert_eq!(transcript.exit_code, Some(10 + i));
        assert_eq!(transcript.stdout, format!("session-{i}\n").into_bytes());
    }
}

#[tokio::test]
async fn dropped_connection_kills_the_child() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["sh"]).await;

    // The loss is noticed when the next output frame cannot be written.
    let script = "echo $$; while :; do echo tick; sleep 0.1; done";
    let mut session = Session::accepted(proxy.port(), "sh", &["-c", script]).await;
    let frame = tokio::time::timeout(TEST_TIMEOUT, session.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.frame_type, FrameType::Stdout);
    let first_line = String::from_utf8(frame.payload).unwrap();
    let pid: i32 = first_line.lines().next().unwrap().trim().parse().unwrap();

    drop(session);

    let pid = nix::unistd::Pid::from_raw(pid);
    let gone = tokio::time::timeout(TEST_TIMEOUT, async {
        while nix::sys::signal::kill(pid, None).is_ok() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "child still running after disconnect");
}

#[tokio::test]
async fn half_closed_client_still_gets_output_and_exit_code() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["sh"]).await;

    let mut session = Session::accepted(proxy.port(), "sh", &["-c", "sleep 0.3; cat"]).await;
    session.send(FrameType::Stdin, b"hello\n").await;
    session.send(FrameType::StdinEof, &[]).await;
    session.writer.shutdown().await.unwrap();

    let transcript = session.finish().await;
    assert_eq!(transcript.stdout, b"hello\n");
    assert_eq!(transcript.exit_code, Some(0));
}

#[tokio::test]
async fn half_close_without_stdin_eof_closes_child_stdin() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["cat"]).await;

    let mut session = Session::accepted(proxy.port(), "cat", &[]).await;
    session.send(FrameType::Stdin, b"partial").await;
    session.writer.shutdown().await.unwrap();

    let transcript = session.finish().await;
    assert_eq!(transcript.stdout, b"partial");
    assert_eq!(transcript.exit_code, Some(0));
}

#[tokio::test]
async fn shutdown_lets_in_flight_sessions_finish() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["sh"]).await;
    let port = proxy.port();

    let session = Session::accepted(port, "sh", &["-c", "sleep 0.5; echo done; exit 7"]).await;
    let shutdown = tokio::spawn(proxy.shutdown());

    let transcript = session.finish().await;
    assert_eq!(transcript.stdout, b"done\n");
    assert_eq!(transcript.exit_code, Some(7));

    tokio::time::timeout(TEST_TIMEOUT, shutdown)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let dir = tempfile::TempDir::new().unwrap();
    let proxy = start_proxy(dir.path(), &["echo"]).await;
    let port = proxy.port();
    proxy.shutdown().await.unwrap();

    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}
