//! Accept loop for the command proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use hostlink_core::ExecPolicy;

use super::error::ProxyError;
use super::session::handle_connection;

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A bound, not yet serving, command proxy.
pub struct ProxyServer {
    listener: TcpListener,
    policy: Arc<ExecPolicy>,
}

impl ProxyServer {
    /// Bind the listener. Use port 0 for an ephemeral port.
    pub async fn bind(addr: SocketAddr, policy: ExecPolicy) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            policy: Arc::new(policy),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips (or its sender is dropped).
    ///
    /// Shutdown releases the listener first, then waits for the sessions
    /// already running to finish.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProxyError> {
        let Self { listener, policy } = self;
        let addr = listener.local_addr()?;
        info!(
            %addr,
            allowed = ?policy.whitelist().sorted(),
            worktree = %policy.worktree_root().display(),
            "Command proxy listening"
        );

        let sessions = TaskTracker::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        sessions.spawn(handle_connection(stream, peer, Arc::clone(&policy)));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        drop(listener);
        sessions.close();
        info!(
            in_flight = sessions.len(),
            "Command proxy stopped accepting, draining sessions"
        );
        sessions.wait().await;
        Ok(())
    }

    /// Bind and serve in a background task.
    pub async fn start(
        addr: SocketAddr,
        policy: ExecPolicy,
    ) -> Result<ProxyServerHandle, ProxyError> {
        let server = Self::bind(addr, policy).await?;
        let local_addr = server.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(server.serve(shutdown_rx));
        Ok(ProxyServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

/// A command proxy serving in the background.
pub struct ProxyServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<(), ProxyError>>,
}

impl ProxyServerHandle {
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port, which is all a caller needs to publish the service.
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting, then wait until every in-flight session has sent its
    /// exit code (or lost its client).
    pub async fn shutdown(self) -> Result<(), ProxyError> {
        let _ = self.shutdown_tx.send(true);
        self.task
            .await
            .map_err(|e| ProxyError::Task(e.to_string()))?
    }
}
