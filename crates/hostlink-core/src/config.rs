//! Configuration resolution for hostlink.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/hostlink/settings.json)
//! 3. Project config (<worktree>/.hostlink/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binaries)
//!
//! The project file lives inside the worktree, which the sandbox can write.
//! It may tune timeouts and logging but never grants commands: its
//! `allowed_commands` and `project_commands` are discarded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};
use crate::policy::DEFAULT_MOUNT_PREFIX;

/// Default per-call timeout for the tool-call gateway.
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 120;

/// Complete hostlink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            gateway: GatewayConfig::default(),
            relay: RelayConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Command proxy server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address; port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Commands the sandbox may run on the host.
    pub allowed_commands: Vec<String>,
    /// Mount point of the worktree inside the sandbox.
    pub mount_prefix: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            allowed_commands: Vec::new(),
            mount_prefix: PathBuf::from(DEFAULT_MOUNT_PREFIX),
        }
    }
}

/// Tool-call gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub timeout_secs: u64,
    /// Named project commands (tool name -> shell expression).
    pub project_commands: BTreeMap<String, String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_GATEWAY_TIMEOUT_SECS,
            project_commands: BTreeMap::new(),
        }
    }
}

/// Socket bridge relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_ip: IpAddr,
    pub socket_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            socket_dir: None,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".hostlink").join("settings.json");
        if project_path.exists() {
            let project = strip_grants(load_config_file(&project_path)?, &project_path);
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Global settings file: `$XDG_CONFIG_HOME/hostlink/settings.json` on Linux,
/// `~/Library/Application Support/hostlink/settings.json` on macOS.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hostlink").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Drop the keys that would widen what the sandbox may run on the host.
fn strip_grants(mut config: Config, path: &Path) -> Config {
    if !config.proxy.allowed_commands.is_empty() {
        warn!(
            path = %path.display(),
            ignored = ?config.proxy.allowed_commands,
            "Ignoring allowed_commands from worktree settings"
        );
        config.proxy.allowed_commands.clear();
    }
    if !config.gateway.project_commands.is_empty() {
        warn!(
            path = %path.display(),
            ignored = ?config.gateway.project_commands.keys().collect::<Vec<_>>(),
            "Ignoring project_commands from worktree settings"
        );
        config.gateway.project_commands.clear();
    }
    config
}

fn merge_config(base: &mut Config, overlay: Config) {
    // Whitelists accumulate across host-side layers.
    for cmd in overlay.proxy.allowed_commands {
        if !base.proxy.allowed_commands.contains(&cmd) {
            base.proxy.allowed_commands.push(cmd);
        }
    }
    base.proxy.bind_addr = overlay.proxy.bind_addr;
    base.proxy.mount_prefix = overlay.proxy.mount_prefix;

    base.gateway.timeout_secs = overlay.gateway.timeout_secs;
    base.gateway
        .project_commands
        .extend(overlay.gateway.project_commands);

    base.relay.bind_ip = overlay.relay.bind_ip;
    if overlay.relay.socket_dir.is_some() {
        base.relay.socket_dir = overlay.relay.socket_dir;
    }

    base.log_level = overlay.log_level;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("HOSTLINK_ALLOWED_COMMANDS") {
        config.proxy.allowed_commands = parse_command_list(&val);
    }
    if let Ok(val) = std::env::var("HOSTLINK_BIND_ADDR") {
        if let Ok(addr) = val.parse() {
            config.proxy.bind_addr = addr;
        }
    }
    if let Ok(val) = std::env::var("HOSTLINK_GATEWAY_TIMEOUT") {
        if let Ok(n) = val.parse() {
            config.gateway.timeout_secs = n;
        }
    }
    if let Ok(val) = std::env::var("HOSTLINK_SOCKET_DIR") {
        config.relay.socket_dir = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("HOSTLINK_LOG_LEVEL") {
        config.log_level = val;
    }
}

/// Split a comma-separated command list, dropping blanks.
pub fn parse_command_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_ephemeral_port_on_all_interfaces() {
        let config = Config::default();
        assert_eq!(config.proxy.bind_addr.port(), 0);
        assert!(config.proxy.bind_addr.ip().is_unspecified());
        assert_eq!(config.proxy.mount_prefix, PathBuf::from("/workspace"));
    }

    #[test]
    fn default_gateway_timeout_is_two_minutes() {
        assert_eq!(Config::default().gateway.timeout_secs, 120);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"proxy":{"allowed_commands":["git"]}}"#).unwrap();
        assert_eq!(config.proxy.allowed_commands, vec!["git"]);
        assert_eq!(config.gateway.timeout_secs, 120);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn layers_accumulate_whitelist_and_commands() {
        let mut base = Config::default();
        base.proxy.allowed_commands = vec!["git".into()];
        let mut overlay = Config::default();
        overlay.proxy.allowed_commands = vec!["git".into(), "cargo".into()];
        overlay
            .gateway
            .project_commands
            .insert("test".into(), "cargo test".into());

        merge_config(&mut base, overlay);
        assert_eq!(base.proxy.allowed_commands, vec!["git", "cargo"]);
        assert_eq!(base.gateway.project_commands["test"], "cargo test");
    }

    #[test]
    fn loads_project_settings_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".hostlink")).unwrap();
        std::fs::write(
            dir.path().join(".hostlink/settings.json"),
            r#"{"gateway":{"timeout_secs":7},"log_level":"debug"}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.gateway.timeout_secs, 7);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn worktree_settings_cannot_grant_commands() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".hostlink")).unwrap();
        std::fs::write(
            dir.path().join(".hostlink/settings.json"),
            r#"{
                "proxy": {"allowed_commands": ["bash"]},
                "gateway": {"timeout_secs": 5, "project_commands": {"pwn": "bash -i"}}
            }"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert!(!config.proxy.allowed_commands.iter().any(|c| c == "bash"));
        assert!(!config.gateway.project_commands.contains_key("pwn"));
        assert_eq!(config.gateway.timeout_secs, 5);
    }

    #[test]
    fn malformed_project_settings_is_a_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".hostlink")).unwrap();
        std::fs::write(dir.path().join(".hostlink/settings.json"), "{").unwrap();
        assert!(matches!(
            load_config(Some(dir.path())),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn command_list_parsing() {
        assert_eq!(parse_command_list(" git, cargo ,,make"), vec!["git", "cargo", "make"]);
        assert!(parse_command_list("").is_empty());
    }
}
