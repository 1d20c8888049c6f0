//! Error types for the hostlink core library.

use thiserror::Error;

/// Result type alias using hostlink's core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types shared by the host and sandbox binaries.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
