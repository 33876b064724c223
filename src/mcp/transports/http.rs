//! HTTP transport: JSON-RPC over a POST endpoint with the same semantics
//! as stdio, plus a plain health endpoint.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::mcp::types::JsonRpcRequest;
use crate::mcp::McpServer;
use crate::Error;

/// Request body cap: MCP JSON-RPC payloads are small.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Serve JSON-RPC over HTTP until ctrl-c. Port 0 asks the OS for a port;
/// the bound address is logged.
pub async fn serve_http(server: Arc<McpServer>) -> Result<(), Error> {
    let mcp = &server.config.mcp;
    let addr = format!("{}:{}", mcp.host, mcp.port);

    let mut router = Router::new()
        .route("/mcp", post(handle_mcp_post))
        .route("/health", get(handle_health));

    if mcp.cors {
        let origins = if mcp.allowed_origins.iter().any(|o| o == "*") {
            AllowOrigin::any()
        } else {
            AllowOrigin::list(
                mcp.allowed_origins
                    .iter()
                    .filter_map(|o| o.parse::<HeaderValue>().ok()),
            )
        };
        let cors = CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any);
        router = router.layer(cors);
    }

    let app = router
        .layer(ServiceBuilder::new().layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)))
        .with_state(Arc::clone(&server));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let bound = listener.local_addr()?;
    tracing::info!(addr = %bound, "MCP HTTP server listening");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutting down HTTP transport");
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn handle_mcp_post(
    State(server): State<Arc<McpServer>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let response = server.handle_request(request).await;

    // 202 for notifications, per streamable-HTTP conventions.
    if response.is_notification_ack() {
        return (StatusCode::ACCEPTED, Json(Value::Null));
    }
    (
        StatusCode::OK,
        Json(serde_json::to_value(&response).unwrap_or_default()),
    )
}

async fn handle_health(State(server): State<Arc<McpServer>>) -> impl IntoResponse {
    let health = server.store.health_check().await;
    Json(serde_json::json!({
        "status": if health.connected && health.errors.is_empty() { "ok" } else { "degraded" },
        "service": "chunkhound",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
