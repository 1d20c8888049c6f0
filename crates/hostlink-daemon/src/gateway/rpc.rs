//! Newline-delimited JSON-RPC 2.0 transport for the tool gateway.
//!
//! One request per line in, one response per line out. Requests without an
//! `id` are notifications and get no reply. Lines are handled in order, so a
//! long-running tool call blocks the next request on the same stream.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::error::GatewayError;
use super::tools::ToolGateway;

/// Protocol revision announced in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const SERVER_NAME: &str = "hostlink-gateway";

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, error: &GatewayError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code: error.code(),
                message: error.to_string(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Serve requests from `input` until EOF, writing responses to `output`.
pub async fn serve<R, W>(
    gateway: &ToolGateway,
    input: R,
    mut output: W,
) -> Result<(), GatewayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(response) = handle_line(gateway, line).await {
            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            output.write_all(&encoded).await?;
            output.flush().await?;
        }
    }
    info!("Gateway input closed");
    Ok(())
}

async fn handle_line(gateway: &ToolGateway, line: &str) -> Option<Response> {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Unparseable gateway request");
            return Some(Response::err(Value::Null, &GatewayError::Json(e)));
        }
    };
    if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        let error = GatewayError::InvalidRequest("jsonrpc must be \"2.0\"".into());
        return request.id.map(|id| Response::err(id, &error));
    }

    let Some(id) = request.id else {
        debug!(method = %request.method, "Notification received");
        return None;
    };
    debug!(method = %request.method, ?id, "Request received");

    Some(match dispatch(gateway, &request.method, request.params).await {
        Ok(result) => Response::ok(id, result),
        Err(e) => {
            warn!(method = %request.method, error = %e, code = e.code(), "Request failed");
            Response::err(id, &e)
        }
    })
}

async fn dispatch(
    gateway: &ToolGateway,
    method: &str,
    params: Value,
) -> Result<Value, GatewayError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => {
            let tools: Vec<Value> = gateway
                .definitions()
                .iter()
                .map(super::tools::ToolDefinition::to_json)
                .collect();
            Ok(json!({ "tools": tools }))
        }
        "tools/call" => {
            let call: CallParams =
                serde_json::from_value(params).map_err(GatewayError::InvalidParams)?;
            let outcome = gateway.call(&call.name, call.arguments).await?;
            info!(tool = %call.name, status = outcome.status(), "Tool call finished");
            Ok(json!({
                "content": [{ "type": "text", "text": outcome.text() }],
                "isError": outcome.is_error(),
                "structuredContent": outcome.structured(),
            }))
        }
        other => Err(GatewayError::MethodNotFound(other.to_string())),
    }
}
