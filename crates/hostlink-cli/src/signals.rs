//! Trap terminal signals so they reach the host command instead of killing
//! the local client.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Install SIGINT/SIGTERM handlers and push each delivery into `tx` as a raw
/// signal number. Ends when the receiver goes away.
pub fn spawn_forwarder(tx: mpsc::Sender<i32>) -> std::io::Result<JoinHandle<()>> {
    let interrupt = SignalKind::interrupt();
    let terminate = SignalKind::terminate();
    let mut sigint = signal(interrupt)?;
    let mut sigterm = signal(terminate)?;

    Ok(tokio::spawn(async move {
        loop {
            let signo = tokio::select! {
                Some(()) = sigint.recv() => interrupt.as_raw_value(),
                Some(()) = sigterm.recv() => terminate.as_raw_value(),
                else => break,
            };
            debug!(signo, "Trapped signal");
            if tx.send(signo).await.is_err() {
                break;
            }
        }
    }))
}
