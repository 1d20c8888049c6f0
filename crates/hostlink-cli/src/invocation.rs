//! Working out what the user asked to run.
//!
//! `hostlink-exec` is normally installed under the name of the command it
//! stands in for (`git -> hostlink-exec`), so `git status` inside the sandbox
//! becomes a proxied `git status` on the host. Invoked under its own name it
//! takes the command explicitly: `hostlink-exec [--addr A] [--cwd D] git status`.

use std::ffi::OsString;
use std::path::Path;

use clap::Parser;

use crate::error::ClientError;

/// Name the binary is installed under.
pub const BINARY_NAME: &str = "hostlink-exec";

/// Proxy address, `host:port`.
pub const ADDR_ENV: &str = "HOSTLINK_ADDR";

/// Overrides the command name taken from a symlinked argv[0].
pub const COMMAND_ENV: &str = "HOSTLINK_COMMAND";

#[derive(Parser, Debug)]
#[command(name = BINARY_NAME)]
#[command(version, about = "Run a whitelisted command on the host through the hostlink proxy")]
struct ExecArgs {
    /// Proxy address (host:port); defaults to $HOSTLINK_ADDR.
    #[arg(long)]
    addr: Option<String>,

    /// Working directory to report to the host; defaults to the current directory.
    #[arg(long)]
    cwd: Option<String>,

    /// Command to run on the host.
    command: String,

    /// Arguments passed through verbatim.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// What argv asked for, before the environment is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: String,
    pub args: Vec<String>,
    pub addr: Option<String>,
    pub cwd: Option<String>,
}

/// Resolve the command from argv.
///
/// If argv[0]'s basename is anything other than [`BINARY_NAME`] we are
/// running through a symlink: the basename (or `command_override`) is the
/// command and every remaining argument is passed through untouched.
pub fn resolve_invocation<I, S>(
    argv: I,
    command_override: Option<String>,
) -> Result<Invocation, ClientError>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
    let invoked_as = argv
        .first()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !invoked_as.is_empty() && invoked_as != BINARY_NAME {
        let args = argv
            .iter()
            .skip(1)
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        return Ok(Invocation {
            command: command_override.unwrap_or(invoked_as),
            args,
            addr: None,
            cwd: None,
        });
    }

    let parsed = ExecArgs::try_parse_from(argv)?;
    Ok(Invocation {
        command: parsed.command,
        args: parsed.args,
        addr: parsed.addr,
        cwd: parsed.cwd,
    })
}

/// Everything needed to run one proxied command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub addr: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
}

impl ClientConfig {
    /// Fill in what argv left open from the environment.
    pub fn from_invocation(
        invocation: Invocation,
        env_addr: Option<String>,
        current_dir: Option<String>,
    ) -> Result<Self, ClientError> {
        let addr = invocation
            .addr
            .or(env_addr)
            .filter(|a| !a.trim().is_empty())
            .ok_or(ClientError::MissingAddr)?;
        Ok(Self {
            addr,
            command: invocation.command,
            args: invocation.args,
            cwd: invocation.cwd.or(current_dir).unwrap_or_default(),
        })
    }

    /// Resolve from the real process arguments and environment.
    pub fn from_process() -> Result<Self, ClientError> {
        let invocation =
            resolve_invocation(std::env::args_os(), std::env::var(COMMAND_ENV).ok())?;
        let current_dir = std::env::current_dir()
            .ok()
            .map(|d| d.to_string_lossy().into_owned());
        Self::from_invocation(invocation, std::env::var(ADDR_ENV).ok(), current_dir)
    }
}
