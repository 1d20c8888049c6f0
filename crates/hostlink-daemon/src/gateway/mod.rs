//! Tool-call gateway: non-interactive, timeout-bounded host commands exposed
//! to an agent as JSON-RPC tools.

pub mod error;
pub mod exec;
pub mod rpc;
pub mod tools;

pub use error::GatewayError;
pub use exec::{ToolOutcome, run_captured};
pub use rpc::serve;
pub use tools::{RUN_COMMAND_TOOL, RunCommandParams, ToolDefinition, ToolGateway};
