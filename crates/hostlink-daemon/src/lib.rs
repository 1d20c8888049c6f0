//! hostlink daemon library
//!
//! Host side of the sandbox bridge:
//! - Command proxy: framed stdio for whitelisted commands over TCP
//! - Tool-call gateway: timeout-bounded commands as JSON-RPC tools
//! - Exit status mapping shared by both

pub mod gateway;
pub mod process;
pub mod proxy;
