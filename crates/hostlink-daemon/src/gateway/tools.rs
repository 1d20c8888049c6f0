//! The tools the gateway exposes: a generic whitelisted `run_command` and
//! one parameterless tool per named project command.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{info, warn};

use hostlink_core::ExecPolicy;

use super::error::GatewayError;
use super::exec::{ToolOutcome, run_captured};

/// Name of the generic execution tool.
pub const RUN_COMMAND_TOOL: &str = "run_command";

/// Arguments accepted by [`RUN_COMMAND_TOOL`].
#[derive(Debug, Clone, Deserialize)]
pub struct RunCommandParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Sandbox working directory; the worktree root when omitted.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Advertised tool metadata.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

/// Dispatches tool calls under a fixed policy and timeout.
pub struct ToolGateway {
    policy: Arc<ExecPolicy>,
    project_commands: BTreeMap<String, String>,
    timeout: Duration,
}

impl ToolGateway {
    pub fn new(
        policy: ExecPolicy,
        project_commands: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Self {
        let mut project_commands = project_commands;
        if project_commands.remove(RUN_COMMAND_TOOL).is_some() {
            warn!(
                "Project command named {RUN_COMMAND_TOOL} shadows the built-in tool, ignoring it"
            );
        }
        Self {
            policy: Arc::new(policy),
            project_commands,
            timeout,
        }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let allowed = self.policy.whitelist().sorted().join(", ");
        let mut tools = vec![ToolDefinition {
            name: RUN_COMMAND_TOOL.to_string(),
            description: format!(
                "Run a whitelisted command on the host and return its combined output. \
                 Allowed commands: {allowed}. Times out after {}s.",
                self.timeout.as_secs()
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Command name"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "cwd": {"type": "string", "description": "Working directory inside the workspace"},
                },
                "required": ["command"],
            }),
        }];
        for (name, expr) in &self.project_commands {
            tools.push(ToolDefinition {
                name: name.clone(),
                description: format!("Run `{expr}` in the project root on the host."),
                input_schema: json!({"type": "object", "properties": {}}),
            });
        }
        tools
    }

    /// Run a whitelisted command. Policy is checked before anything spawns.
    pub async fn run_command(&self, params: RunCommandParams) -> ToolOutcome {
        let cwd = match self
            .policy
            .authorize(&params.command, params.cwd.as_deref().unwrap_or_default())
        {
            Ok(cwd) => cwd,
            Err(reason) => {
                warn!(command = %params.command, %reason, "Tool call rejected");
                return ToolOutcome::Rejected(reason);
            }
        };
        info!(
            command = %params.command,
            args = ?params.args,
            cwd = %cwd.display(),
            "Running tool command"
        );

        let mut command = Command::new(&params.command);
        command.args(&params.args).current_dir(&cwd);
        run_captured(command, self.timeout).await
    }

    /// Run a named project command, or `None` if no such command exists.
    pub async fn run_project_command(&self, name: &str) -> Option<ToolOutcome> {
        let expr = self.project_commands.get(name)?;
        info!(tool = name, %expr, "Running project command");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(expr)
            .current_dir(self.policy.worktree_root());
        Some(run_captured(command, self.timeout).await)
    }

    /// Dispatch a call by tool name.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<ToolOutcome, GatewayError> {
        if name == RUN_COMMAND_TOOL {
            let params: RunCommandParams =
                serde_json::from_value(arguments).map_err(GatewayError::InvalidParams)?;
            return Ok(self.run_command(params).await);
        }
        self.run_project_command(name)
            .await
            .ok_or_else(|| GatewayError::UnknownTool(name.to_string()))
    }
}
