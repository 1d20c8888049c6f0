//! hostlink relay
//!
//! Prints one JSON array of `{socket_name, tcp_port}` mappings on stdout,
//! then relays until SIGINT or SIGTERM.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use hostlink_core::config::load_config;
use hostlink_relay::{ProxyMapping, SocketRelay};

#[derive(Parser, Debug)]
#[command(name = "hostlink-relay")]
#[command(version, about = "hostlink relay - Unix sockets to TCP for sandboxes")]
struct Args {
    /// Directory holding the `*.sock` files to publish.
    #[arg(long, env = "HOSTLINK_SOCKET_DIR")]
    dir: Option<PathBuf>,

    /// Address the TCP listeners bind to.
    #[arg(long)]
    bind_ip: Option<IpAddr>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "HOSTLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "HOSTLINK_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(None)?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    hostlink_core::tracing_init::init_tracing(
        &format!("hostlink_relay={log_level}"),
        args.log_json,
    );

    let dir = args
        .dir
        .or(config.relay.socket_dir)
        .ok_or_else(|| {
            anyhow::anyhow!("no socket directory given (--dir or HOSTLINK_SOCKET_DIR)")
        })?;
    let bind_ip = args.bind_ip.unwrap_or(config.relay.bind_ip);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        dir = %dir.display(),
        %bind_ip,
        "Starting hostlink relay"
    );
    let handle = SocketRelay::start(&dir, bind_ip).await?;
    announce(handle.mappings())?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        _ = sigterm.recv() => info!("Received SIGTERM shutdown signal"),
    }

    handle.stop().await;
    info!("Relay stopped");
    Ok(())
}

#[allow(clippy::print_stdout)]
fn announce(mappings: &[ProxyMapping]) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(mappings)?);
    Ok(())
}
