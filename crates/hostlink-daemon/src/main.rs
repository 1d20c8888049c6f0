//! hostlink daemon
//!
//! Runs on the host next to a sandbox. `proxy` serves whitelisted commands
//! with interactive stdio over TCP; `gateway` serves timeout-bounded
//! commands as JSON-RPC tools on stdio.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use hostlink_core::config::{Config, load_config};
use hostlink_core::{Confinement, ExecPolicy, Whitelist};
use hostlink_daemon::gateway::{self, ToolGateway};
use hostlink_daemon::proxy::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "hostlink-daemon")]
#[command(version, about = "hostlink daemon - sandbox to host command bridge")]
struct Cli {
    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, env = "HOSTLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "HOSTLINK_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve whitelisted commands over TCP and print the bound port.
    Proxy {
        #[command(flatten)]
        policy: PolicyArgs,

        /// Listen address (port 0 picks an ephemeral port).
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Serve the tool-call gateway on stdin/stdout.
    Gateway {
        #[command(flatten)]
        policy: PolicyArgs,

        /// Per-call timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Extra project command exposed as a tool, as NAME=EXPR.
        #[arg(long = "project-command", value_parser = parse_project_command)]
        project_commands: Vec<(String, String)>,
    },
}

#[derive(Args, Debug)]
struct PolicyArgs {
    /// Host worktree mounted into the sandbox (defaults to the current directory).
    #[arg(long, env = "HOSTLINK_WORKTREE")]
    worktree: Option<PathBuf>,

    /// Command the sandbox may run; repeat for each command.
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// Mount point of the worktree inside the sandbox.
    #[arg(long)]
    mount_prefix: Option<PathBuf>,
}

impl PolicyArgs {
    fn worktree(&self) -> anyhow::Result<PathBuf> {
        match &self.worktree {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    /// CLI flags layered over the resolved config.
    fn build(&self, config: &Config) -> anyhow::Result<ExecPolicy> {
        let worktree = self.worktree()?;
        if !worktree.is_dir() {
            anyhow::bail!("worktree {} is not a directory", worktree.display());
        }

        let whitelist: Whitelist = config
            .proxy
            .allowed_commands
            .iter()
            .chain(&self.allow)
            .cloned()
            .collect();
        if whitelist.is_empty() {
            warn!("No commands are allowed; every request will be rejected");
        }

        let mount_prefix = self
            .mount_prefix
            .clone()
            .unwrap_or_else(|| config.proxy.mount_prefix.clone());
        let confinement = Confinement::new(&worktree)?.with_mount_prefix(mount_prefix);
        Ok(ExecPolicy::new(whitelist, confinement))
    }
}

fn parse_project_command(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, expr)) if !name.trim().is_empty() && !expr.trim().is_empty() => {
            Ok((name.trim().to_string(), expr.to_string()))
        }
        _ => Err(format!("expected NAME=EXPR, got {value:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let policy_args = match &cli.mode {
        Mode::Proxy { policy, .. } | Mode::Gateway { policy, .. } => policy,
    };
    let config = load_config(Some(&policy_args.worktree()?))?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    hostlink_core::tracing_init::init_tracing(
        &format!("hostlink_daemon={log_level},hostlink_core={log_level}"),
        cli.log_json,
    );

    match cli.mode {
        Mode::Proxy { policy, bind } => {
            let policy = policy.build(&config)?;
            run_proxy(policy, bind.unwrap_or(config.proxy.bind_addr)).await
        }
        Mode::Gateway {
            policy,
            timeout,
            project_commands,
        } => {
            let policy = policy.build(&config)?;
            let mut commands: BTreeMap<String, String> = config.gateway.project_commands.clone();
            commands.extend(project_commands);
            let timeout = Duration::from_secs(timeout.unwrap_or(config.gateway.timeout_secs));
            run_gateway(policy, commands, timeout).await
        }
    }
}

async fn run_proxy(policy: ExecPolicy, bind: SocketAddr) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        %bind,
        "Starting hostlink command proxy"
    );
    let handle = ProxyServer::start(bind, policy).await?;
    announce_port(handle.port());

    // `true` unsets $NOTIFY_SOCKET so proxied commands don't notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        _ = sigterm.recv() => info!("Received SIGTERM shutdown signal"),
    }

    // Running sessions drain first; a second signal stops waiting for them.
    tokio::select! {
        result = handle.shutdown() => result?,
        _ = tokio::signal::ctrl_c() => warn!("Second Ctrl+C, abandoning in-flight sessions"),
        _ = sigterm.recv() => warn!("Second SIGTERM, abandoning in-flight sessions"),
    }
    info!("Command proxy stopped");
    Ok(())
}

#[allow(clippy::print_stdout)]
fn announce_port(port: u16) {
    println!("{}", serde_json::json!({ "port": port }));
}

async fn run_gateway(
    policy: ExecPolicy,
    project_commands: BTreeMap<String, String>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let gateway = ToolGateway::new(policy, project_commands, timeout);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        timeout_secs = timeout.as_secs(),
        tools = gateway.definitions().len(),
        "Starting hostlink tool gateway on stdio"
    );
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    gateway::serve(&gateway, stdin, tokio::io::stdout()).await?;
    Ok(())
}
