//! hostlink relay library
//!
//! Publishes the host's Unix domain sockets (Docker, SSH agent, ...) to a
//! sandbox that can only reach the host over TCP.

pub mod discover;
pub mod error;
pub mod relay;

pub use discover::discover_sockets;
pub use error::RelayError;
pub use relay::{ProxyMapping, RelayHandle, SocketRelay};
