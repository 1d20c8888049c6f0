//! Tool-call gateway error types.

/// JSON-RPC error codes used by the gateway.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
}

/// Errors surfaced by the gateway. Tool outcomes (including non-zero exits
/// and timeouts) are not errors; these are protocol-level failures.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid params: {0}")]
    InvalidParams(serde_json::Error),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// The JSON-RPC error code reported to the caller.
    pub const fn code(&self) -> i64 {
        match self {
            Self::UnknownTool(_) | Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::InvalidRequest(_) | Self::Io(_) => codes::INVALID_REQUEST,
            Self::Json(_) => codes::PARSE_ERROR,
        }
    }
}
