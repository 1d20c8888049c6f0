//! Command proxy server.
//!
//! Lets a sandboxed client run whitelisted host commands with interactive
//! stdio, signal forwarding and exit code delivery over the framed
//! protocol from `hostlink_core::frame`.

pub mod error;
pub mod server;
pub mod session;

pub use error::ProxyError;
pub use server::{ProxyServer, ProxyServerHandle};
pub use session::SessionEnd;
