//! hostlink client library
//!
//! Sandbox side of the command proxy: resolves which command to run, then
//! relays stdio, signals and the exit status over one TCP session.

pub mod client;
pub mod error;
pub mod invocation;
pub mod signals;

pub use client::ProxyClient;
pub use error::{ClientError, FALLBACK_EXIT_CODE};
pub use invocation::{ClientConfig, Invocation, resolve_invocation};
