//! TCP listeners bridged onto host Unix sockets.
//!
//! Each reachable socket gets its own ephemeral TCP port. Every accepted TCP
//! connection dials the socket afresh and copies bytes both ways until both
//! directions have finished. All accept loops and bridges are tracked so
//! [`RelayHandle::stop`] can cancel them and wait for them to wind down.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::discover::discover_sockets;
use crate::error::RelayError;

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One published socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyMapping {
    pub socket_name: String,
    pub tcp_port: u16,
}

pub struct SocketRelay;

impl SocketRelay {
    /// Publish every reachable socket in `dir` on `bind_ip`.
    ///
    /// Sockets that refuse a probe connection (typically stale files left by
    /// a dead server) are skipped with a warning rather than failing the
    /// whole relay. If a listener cannot be bound, everything published so
    /// far is stopped before the error is returned.
    pub async fn start(dir: &Path, bind_ip: IpAddr) -> Result<RelayHandle, RelayError> {
        let names = discover_sockets(dir).map_err(|source| RelayError::ReadDir {
            dir: dir.to_path_buf(),
            source,
        })?;

        let mut handle = RelayHandle::new();
        for socket_name in names {
            if let Err(e) = handle.publish(dir, socket_name, bind_ip).await {
                handle.stop().await;
                return Err(e);
            }
        }

        if handle.mappings.is_empty() {
            info!(dir = %dir.display(), "No reachable sockets to relay");
        }
        Ok(handle)
    }
}

/// A running relay. Dropping it cancels everything without waiting.
pub struct RelayHandle {
    mappings: Vec<ProxyMapping>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RelayHandle {
    fn new() -> Self {
        Self {
            mappings: Vec::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn mappings(&self) -> &[ProxyMapping] {
        &self.mappings
    }

    /// Bind a listener for one socket and start relaying it. An unreachable
    /// socket is skipped, not an error.
    async fn publish(
        &mut self,
        dir: &Path,
        socket_name: String,
        bind_ip: IpAddr,
    ) -> Result<(), RelayError> {
        let path = dir.join(&socket_name);
        if let Err(e) = UnixStream::connect(&path).await {
            warn!(socket = %socket_name, error = %e, "Socket not reachable, skipping");
            return Ok(());
        }

        let listener = TcpListener::bind(SocketAddr::new(bind_ip, 0))
            .await
            .map_err(|source| RelayError::Bind {
                socket_name: socket_name.clone(),
                source,
            })?;
        let tcp_port = listener.local_addr()?.port();
        info!(socket = %socket_name, tcp_port, "Relaying socket");

        let span = info_span!("relay", socket = %socket_name, tcp_port);
        self.tracker.spawn(
            accept_loop(listener, path, self.cancel.clone(), self.tracker.clone())
                .instrument(span),
        );
        self.mappings.push(ProxyMapping {
            socket_name,
            tcp_port,
        });
        Ok(())
    }

    /// Close every listener and open connection, and wait until all relay
    /// tasks have finished.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Relay stopped");
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    socket_path: PathBuf,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = cancel.cancelled() => break,
        };
        match accepted {
            Ok((tcp, peer)) => {
                debug!(%peer, "Connection accepted");
                tracker.spawn(
                    bridge(tcp, socket_path.clone(), cancel.clone()).in_current_span(),
                );
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::select! {
                    () = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
    }
    debug!("Listener closed");
}

/// Copy bytes between one TCP client and a fresh connection to the socket.
///
/// When either side reaches EOF the other side's write half is shut down,
/// so the opposite direction can still drain.
async fn bridge(mut tcp: TcpStream, socket_path: PathBuf, cancel: CancellationToken) {
    let mut unix = match UnixStream::connect(&socket_path).await {
        Ok(unix) => unix,
        Err(e) => {
            warn!(
                socket = %socket_path.display(),
                error = %e,
                "Cannot dial socket, dropping connection"
            );
            return;
        }
    };

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut tcp, &mut unix) => match copied {
            Ok((to_socket, to_client)) => debug!(to_socket, to_client, "Connection finished"),
            Err(e) => debug!(error = %e, "Connection ended with error"),
        },
        () = cancel.cancelled() => debug!("Connection cancelled"),
    }
}
