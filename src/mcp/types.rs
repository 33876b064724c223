//! JSON-RPC and MCP protocol types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed JSON-RPC request: {0}")]
    Malformed(String),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid tool arguments: {0}")]
    InvalidParams(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

/// JSON-RPC response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Notifications (no id, null result) get no reply on the wire.
    pub fn is_notification_ack(&self) -> bool {
        self.id.is_none()
            && self
                .result
                .as_ref()
                .map(|v| v.is_null())
                .unwrap_or(false)
    }
}

/// JSON-RPC error
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes.
pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32000;

// MCP protocol types

#[derive(Serialize)]
pub(crate) struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Serialize)]
pub(crate) struct ServerCapabilities {
    pub tools: ToolsCapability,
}

#[derive(Serialize)]
pub(crate) struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Serialize)]
pub(crate) struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// `search_regex` tool arguments.
#[derive(Debug, Deserialize)]
pub(crate) struct SearchRegexArgs {
    pub pattern: String,
    pub page_size: Option<usize>,
    pub offset: Option<usize>,
    pub path: Option<String>,
    pub max_response_tokens: Option<usize>,
}

/// `search_semantic` tool arguments.
#[derive(Debug, Deserialize)]
pub(crate) struct SearchSemanticArgs {
    pub query: String,
    pub page_size: Option<usize>,
    pub offset: Option<usize>,
    pub path: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub threshold: Option<f32>,
    pub max_response_tokens: Option<usize>,
}
