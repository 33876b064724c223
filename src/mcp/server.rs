//! MCP server core: owns the storage engine, registries, coordinator, and
//! watcher, and dispatches JSON-RPC requests to the tool handlers.
//!
//! Startup sequence: validate config → open storage → build services →
//! initial directory scan → start the realtime watcher → accept requests.
//! Shutdown stops the watcher and disconnects storage (forcing a final
//! checkpoint); both paths are idempotent.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::config::Config;
use crate::embedding::{EmbeddingProviderRegistry, EmbeddingService};
use crate::indexing::IndexingCoordinator;
use crate::parser::ParserRegistry;
use crate::search::SearchService;
use crate::store::StorageEngine;
use crate::watch::RealtimeWatcher;
use crate::Error;

use super::tools;
use super::types::{
    InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ServerCapabilities,
    ServerInfo, ToolsCapability, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
};

/// MCP protocol version this server speaks.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub struct McpServer {
    pub(crate) config: Config,
    pub(crate) project_root: PathBuf,
    pub(crate) store: Arc<StorageEngine>,
    pub(crate) search: Arc<SearchService>,
    pub(crate) embedders: Arc<EmbeddingProviderRegistry>,
    #[allow(dead_code)]
    pub(crate) coordinator: Arc<IndexingCoordinator>,
    watcher: tokio::sync::Mutex<Option<RealtimeWatcher>>,
    /// Caps in-flight tool calls at `mcp.max_concurrent_requests`.
    request_slots: tokio::sync::Semaphore,
    shut_down: AtomicBool,
}

impl McpServer {
    /// Full startup: open storage, run the initial scan, start the
    /// watcher. Only after this returns may a transport accept requests.
    pub async fn initialize(
        config: Config,
        project_root: &Path,
        embedders: EmbeddingProviderRegistry,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;

        let db_path = config.database.resolved_path(project_root);
        let store = Arc::new(StorageEngine::connect(&db_path).await?);
        let embedders = Arc::new(embedders);

        let embedding_service = embedders
            .get(None)
            .ok()
            .map(|provider| Arc::new(EmbeddingService::new(Arc::clone(&store), provider)));

        let coordinator = Arc::new(IndexingCoordinator::new(
            Arc::clone(&store),
            Arc::new(ParserRegistry::new()),
            embedding_service.clone(),
            config.indexing.clone(),
        ));
        let search = Arc::new(SearchService::new(
            Arc::clone(&store),
            Arc::clone(&embedders),
        ));

        tracing::info!(root = %project_root.display(), "Running initial directory scan");
        let report = coordinator
            .process_directory(project_root, None, None)
            .await?;
        tracing::info!(
            files = report.files_processed,
            chunks = report.total_chunks,
            errors = report.errors.len(),
            "Initial scan complete"
        );

        let watcher = RealtimeWatcher::start(
            project_root,
            Arc::clone(&coordinator),
            embedding_service,
            &config.indexing,
        )?;

        let request_slots =
            tokio::sync::Semaphore::new(config.mcp.max_concurrent_requests.max(1));
        Ok(Arc::new(Self {
            config,
            project_root: project_root.to_path_buf(),
            store,
            search,
            embedders,
            coordinator,
            watcher: tokio::sync::Mutex::new(Some(watcher)),
            request_slots,
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Assemble a server from pre-built components without scanning or
    /// watching. Used by embedders of the library and the test suite.
    pub fn from_parts(
        config: Config,
        project_root: &Path,
        store: Arc<StorageEngine>,
        search: Arc<SearchService>,
        embedders: Arc<EmbeddingProviderRegistry>,
        coordinator: Arc<IndexingCoordinator>,
    ) -> Arc<Self> {
        let request_slots =
            tokio::sync::Semaphore::new(config.mcp.max_concurrent_requests.max(1));
        Arc::new(Self {
            config,
            project_root: project_root.to_path_buf(),
            store,
            search,
            embedders,
            coordinator,
            watcher: tokio::sync::Mutex::new(None),
            request_slots,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Stop the watcher and disconnect storage. Idempotent.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.stop().await;
        }
        self.store.disconnect().await?;
        tracing::info!("MCP server shut down");
        Ok(())
    }

    /// Handle one JSON-RPC request. Takes `&self`; concurrent requests are
    /// fine.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id;
        let outcome: Result<Value, JsonRpcError> = match request.method.as_str() {
            "initialize" => Ok(self.initialize_result()),
            // Notification: acknowledged without a wire response.
            "initialized" | "notifications/initialized" => Ok(Value::Null),
            "tools/list" => Ok(tools::tools_list(self)),
            "tools/call" => self.bounded_tools_call(request.params).await,
            other => Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Unknown method: {}", other),
                data: None,
            }),
        };

        match outcome {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::failure(id, error),
        }
    }

    /// Run a tool call under the concurrency cap and the configured
    /// request timeout.
    async fn bounded_tools_call(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let _slot = self
            .request_slots
            .acquire()
            .await
            .map_err(|_| JsonRpcError {
                code: INTERNAL_ERROR,
                message: "server is shutting down".into(),
                data: None,
            })?;

        let timeout = std::time::Duration::from_secs(self.config.mcp.request_timeout.max(1));
        match tokio::time::timeout(timeout, tools::handle_tools_call(self, params)).await {
            Ok(result) => result.map_err(|e| self.to_rpc_error(e)),
            Err(_) => Err(JsonRpcError {
                code: INTERNAL_ERROR,
                message: format!("request timed out after {}s", timeout.as_secs()),
                data: Some(serde_json::json!({
                    "type": "protocol_error",
                    "message": "request timed out",
                    "retryable": true,
                })),
            }),
        }
    }

    fn initialize_result(&self) -> Value {
        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.into(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: "chunkhound".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };
        serde_json::to_value(result).unwrap_or(Value::Null)
    }

    /// Encode a core error as a JSON-RPC error. The payload carries a
    /// `{type, message}` object; tracebacks never cross the wire unless
    /// debug mode is on.
    fn to_rpc_error(&self, error: Error) -> JsonRpcError {
        let code = match &error {
            Error::Protocol(_) => INVALID_PARAMS,
            Error::Config(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        let message = if self.config.debug {
            format!("{:?}", error)
        } else {
            error.to_string()
        };
        tracing::debug!(kind = error.kind(), error = %message, "Tool call failed");
        JsonRpcError {
            code,
            message: message.clone(),
            data: Some(serde_json::json!({
                "type": error.kind(),
                "message": message,
                "retryable": error.is_retryable(),
            })),
        }
    }
}
