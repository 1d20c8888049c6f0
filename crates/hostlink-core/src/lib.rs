//! hostlink core library
//!
//! Shared functionality for the hostlink components:
//! - Frame codec for the command proxy wire protocol
//! - Session handshake messages
//! - Command whitelist and worktree path confinement
//! - Configuration resolution and hierarchy
//! - Common error types and tracing setup

pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod policy;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use frame::{Frame, FrameError, FrameType, FrameWriter};
pub use handshake::{HandshakeError, HandshakeRequest, HandshakeResponse};
pub use policy::{Confinement, ExecPolicy, PolicyError, Whitelist};
