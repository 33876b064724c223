//! MCP tool registry and dispatch.
//!
//! Four tools: `get_stats`, `health_check`, `search_regex`, and
//! `search_semantic`. The semantic tool is only registered (and only
//! callable) when at least one embedding provider exists.

mod search;
mod stats;

use serde_json::{json, Value};

use crate::mcp::types::ProtocolError;
use crate::mcp::McpServer;
use crate::Error;

use super::limits::{MAX_ALLOWED_TOKENS, MAX_RESPONSE_TOKENS, MIN_RESPONSE_TOKENS};

/// `tools/list` result.
pub(crate) fn tools_list(server: &McpServer) -> Value {
    let mut tools = vec![
        json!({
            "name": "get_stats",
            "description": "Get storage statistics: indexed files, chunks, embeddings, and providers.",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "health_check",
            "description": "Check server health: storage connectivity and registered embedding providers.",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "search_regex",
            "description": "Search code chunks with a regular expression. Results are ordered by (file path, start line) and paginated.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression applied to chunk content"},
                    "page_size": {"type": "integer", "minimum": 1, "maximum": 100, "default": 10},
                    "offset": {"type": "integer", "minimum": 0, "default": 0},
                    "path": {"type": "string", "description": "Restrict to paths containing this relative fragment"},
                    "max_response_tokens": {
                        "type": "integer",
                        "minimum": MIN_RESPONSE_TOKENS,
                        "maximum": MAX_ALLOWED_TOKENS,
                        "default": MAX_RESPONSE_TOKENS
                    }
                },
                "required": ["pattern"]
            }
        }),
    ];

    // Tools requiring embeddings are hidden when no provider is registered.
    if !server.embedders.is_empty() {
        tools.push(json!({
            "name": "search_semantic",
            "description": "Semantic nearest-neighbor search over embedded code chunks. Finds code by meaning, not exact text.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Natural language description of the code you want"},
                    "page_size": {"type": "integer", "minimum": 1, "maximum": 100, "default": 10},
                    "offset": {"type": "integer", "minimum": 0, "default": 0},
                    "path": {"type": "string", "description": "Restrict to paths containing this relative fragment"},
                    "provider": {"type": "string", "description": "Embedding provider name (defaults to the configured provider)"},
                    "model": {"type": "string", "description": "Embedding model name (defaults to the provider's model)"},
                    "threshold": {"type": "number", "description": "Minimum similarity score 0.0-1.0"},
                    "max_response_tokens": {
                        "type": "integer",
                        "minimum": MIN_RESPONSE_TOKENS,
                        "maximum": MAX_ALLOWED_TOKENS,
                        "default": MAX_RESPONSE_TOKENS
                    }
                },
                "required": ["query"]
            }
        }));
    }

    json!({ "tools": tools })
}

/// `tools/call` dispatch.
pub(crate) async fn handle_tools_call(
    server: &McpServer,
    params: Option<Value>,
) -> Result<Value, Error> {
    let params = params
        .ok_or_else(|| ProtocolError::InvalidParams("missing tools/call params".into()))?;
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProtocolError::InvalidParams("missing tool name".into()))?
        .to_string();
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name.as_str() {
        "get_stats" => stats::tool_get_stats(server).await,
        "health_check" => stats::tool_health_check(server).await,
        "search_regex" => search::tool_search_regex(server, arguments).await,
        "search_semantic" if !server.embedders.is_empty() => {
            search::tool_search_semantic(server, arguments).await
        }
        other => Err(ProtocolError::UnknownTool(other.to_string()).into()),
    }
}

/// Wrap a tool's JSON payload as a single text content block, the MCP
/// tool-result wire shape.
pub(crate) fn tool_text_result(payload: &Value) -> Result<Value, Error> {
    let text = serde_json::to_string(payload)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(json!({
        "content": [{"type": "text", "text": text}]
    }))
}
