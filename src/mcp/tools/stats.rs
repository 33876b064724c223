//! Stats and health tools.

use serde_json::{json, Value};

use crate::mcp::McpServer;
use crate::Error;

use super::tool_text_result;

pub(crate) async fn tool_get_stats(server: &McpServer) -> Result<Value, Error> {
    let stats = server.store.get_stats().await?;
    tool_text_result(&json!({
        "files": stats.files,
        "chunks": stats.chunks,
        "embeddings": stats.embeddings,
        "providers": stats.providers,
    }))
}

/// Health check never fails: problems are reported in the payload.
pub(crate) async fn tool_health_check(server: &McpServer) -> Result<Value, Error> {
    let health = server.store.health_check().await;
    let status = if health.connected && health.errors.is_empty() {
        "healthy"
    } else {
        "degraded"
    };
    tool_text_result(&json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "storage_connected": health.connected,
        "embedding_providers": server.embedders.list(),
    }))
}
