//! Stdio transport: newline-framed JSON-RPC on stdin/stdout.
//!
//! Stdout carries responses and nothing else; diagnostics go to the
//! tracing subscriber, which in stdio mode writes to a debug file only
//! when `CHUNKHOUND_DEBUG` is set (see the binary's logging setup).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};
use crate::mcp::McpServer;
use crate::Error;

/// Serve until stdin closes. The caller shuts the server down afterwards.
pub async fn serve_stdio(server: Arc<McpServer>) -> Result<(), Error> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => server.handle_request(request).await,
            Err(e) => JsonRpcResponse::failure(
                None,
                JsonRpcError {
                    code: PARSE_ERROR,
                    message: format!("Parse error: {}", e),
                    data: None,
                },
            ),
        };

        // Notifications produce no wire response.
        if response.is_notification_ack() {
            continue;
        }

        let payload = serde_json::to_string(&response)
            .unwrap_or_else(|e| format!(r#"{{"jsonrpc":"2.0","error":{{"code":-32000,"message":"serialization failed: {}"}}}}"#, e));
        stdout.write_all(payload.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    tracing::debug!("stdin closed, stdio transport exiting");
    Ok(())
}
