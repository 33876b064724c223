//! MCP server tests: tool registry, dispatch, clamping, response limiting,
//! and error encoding.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use chunkhound::config::Config;
use chunkhound::embedding::EmbeddingProviderRegistry;
use chunkhound::mcp::{JsonRpcRequest, McpServer};
use chunkhound::search::SearchService;
use chunkhound::Language;
use common::*;

async fn server_without_embedder() -> (Arc<McpServer>, Arc<chunkhound::StorageEngine>, tempfile::TempDir) {
    let (store, dir) = temp_store().await;
    let embedders = Arc::new(EmbeddingProviderRegistry::new());
    let search = Arc::new(SearchService::new(Arc::clone(&store), Arc::clone(&embedders)));
    let coordinator = Arc::new(coordinator_for(Arc::clone(&store)));
    let server = McpServer::from_parts(
        Config::default(),
        dir.path(),
        Arc::clone(&store),
        search,
        embedders,
        coordinator,
    );
    (server, store, dir)
}

async fn server_with_embedder() -> (Arc<McpServer>, Arc<chunkhound::StorageEngine>, tempfile::TempDir) {
    let (store, dir) = temp_store().await;
    let mut registry = EmbeddingProviderRegistry::new();
    registry.register(Arc::new(MockEmbedder::new()));
    let embedders = Arc::new(registry);
    let search = Arc::new(SearchService::new(Arc::clone(&store), Arc::clone(&embedders)));
    let coordinator = Arc::new(coordinator_for(Arc::clone(&store)));
    let server = McpServer::from_parts(
        Config::default(),
        dir.path(),
        Arc::clone(&store),
        search,
        embedders,
        coordinator,
    );
    (server, store, dir)
}

fn request(method: &str, params: Value) -> JsonRpcRequest {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    }))
    .unwrap()
}

fn tool_call(name: &str, arguments: Value) -> JsonRpcRequest {
    request("tools/call", json!({"name": name, "arguments": arguments}))
}

/// Tool results wrap a JSON payload in a single text content block.
fn tool_payload(result: &Value) -> Value {
    let text = result["content"][0]["text"].as_str().expect("text content");
    serde_json::from_str(text).expect("payload is JSON")
}

#[tokio::test]
async fn test_tools_list_hides_semantic_without_embedder() {
    let (server, store, _dir) = server_without_embedder().await;
    let response = server.handle_request(request("tools/list", json!({}))).await;
    let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();

    assert!(names.contains(&"get_stats"));
    assert!(names.contains(&"health_check"));
    assert!(names.contains(&"search_regex"));
    assert!(!names.contains(&"search_semantic"));
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_tools_list_includes_semantic_with_embedder() {
    let (server, store, _dir) = server_with_embedder().await;
    let response = server.handle_request(request("tools/list", json!({}))).await;
    let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"search_semantic"));
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_initialize_handshake() {
    let (server, store, _dir) = server_without_embedder().await;
    let response = server
        .handle_request(request("initialize", json!({"protocolVersion": "2024-11-05"})))
        .await;
    let result = response.result.unwrap();
    assert_eq!(result["serverInfo"]["name"], "chunkhound");
    assert!(result["protocolVersion"].is_string());
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_and_tool() {
    let (server, store, _dir) = server_without_embedder().await;

    let response = server.handle_request(request("bogus/method", json!({}))).await;
    assert_eq!(response.error.unwrap().code, -32601);

    let response = server.handle_request(tool_call("bogus_tool", json!({}))).await;
    let error = response.error.unwrap();
    assert!(error.message.contains("bogus_tool"));
    assert_eq!(error.data.unwrap()["type"], "protocol_error");
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_get_stats_tool() {
    let (server, store, _dir) = server_without_embedder().await;
    let file_id = seed_file(&store, "/proj/a.py", Language::Python).await;
    seed_chunk(&store, file_id, "def x(): pass", 1).await;

    let response = server.handle_request(tool_call("get_stats", json!({}))).await;
    let payload = tool_payload(&response.result.unwrap());
    assert_eq!(payload["files"], 1);
    assert_eq!(payload["chunks"], 1);
    assert_eq!(payload["embeddings"], 0);
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_health_check_tool() {
    let (server, store, _dir) = server_with_embedder().await;
    let response = server.handle_request(tool_call("health_check", json!({}))).await;
    let payload = tool_payload(&response.result.unwrap());
    assert_eq!(payload["status"], "healthy");
    assert_eq!(payload["storage_connected"], true);
    assert_eq!(payload["embedding_providers"], json!([TEST_PROVIDER]));
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_search_regex_tool_end_to_end() {
    let (server, store, _dir) = server_without_embedder().await;
    let file_id = seed_file(&store, "/proj/a.py", Language::Python).await;
    seed_chunk(&store, file_id, "def FIND_ME(): pass", 1).await;
    seed_chunk(&store, file_id, "def ignore(): pass", 10).await;

    let response = server
        .handle_request(tool_call("search_regex", json!({"pattern": "FIND_ME"})))
        .await;
    let payload = tool_payload(&response.result.unwrap());
    let results = payload["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["symbol"], "fn_at_1");
    assert_eq!(payload["pagination"]["total"], 1);
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_search_regex_clamps_page_size() {
    let (server, store, _dir) = server_without_embedder().await;
    let file_id = seed_file(&store, "/proj/a.py", Language::Python).await;
    for i in 0..3 {
        seed_chunk(&store, file_id, &format!("clamp_case_{}", i), i + 1).await;
    }

    let response = server
        .handle_request(tool_call(
            "search_regex",
            json!({"pattern": "clamp_case", "page_size": 0}),
        ))
        .await;
    let payload = tool_payload(&response.result.unwrap());
    assert_eq!(payload["results"].as_array().unwrap().len(), 1);
    assert_eq!(payload["pagination"]["page_size"], 1);
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_search_regex_path_filter_violation() {
    let (server, store, _dir) = server_without_embedder().await;
    let response = server
        .handle_request(tool_call(
            "search_regex",
            json!({"pattern": "x", "path": "../escape"}),
        ))
        .await;
    let error = response.error.unwrap();
    assert_eq!(error.data.unwrap()["type"], "config_error");
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_search_semantic_tool_without_embedder_fails() {
    let (server, store, _dir) = server_without_embedder().await;
    let response = server
        .handle_request(tool_call("search_semantic", json!({"query": "anything"})))
        .await;
    // Tool is not registered: unknown tool.
    assert!(response.error.is_some());
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_search_semantic_tool_end_to_end() {
    let (server, store, _dir) = server_with_embedder().await;
    let file_id = seed_file(&store, "/proj/src/a.py", Language::Python).await;
    let chunk_id = seed_chunk(&store, file_id, "def target(): pass", 1).await;
    seed_embedding(&store, chunk_id, "find this exact text").await;

    let response = server
        .handle_request(tool_call(
            "search_semantic",
            json!({"query": "find this exact text"}),
        ))
        .await;
    let payload = tool_payload(&response.result.unwrap());
    let results = payload["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0]["chunk_id"], chunk_id);
    assert!(results[0]["similarity"].as_f64().unwrap() > 0.999);
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_response_size_limiting_updates_pagination() {
    let (server, store, _dir) = server_without_embedder().await;
    let file_id = seed_file(&store, "/proj/big.py", Language::Python).await;
    // 30 chunks of ~2000 chars each: far beyond a 1000-token budget.
    for i in 0..30 {
        let code = format!("def limited_{}():\n    {}", i, "x".repeat(2000));
        seed_chunk(&store, file_id, &code, i + 1).await;
    }

    let response = server
        .handle_request(tool_call(
            "search_regex",
            json!({"pattern": "limited_", "page_size": 30, "max_response_tokens": 1000}),
        ))
        .await;
    let payload = tool_payload(&response.result.unwrap());
    let results = payload["results"].as_array().unwrap();
    assert!(results.len() < 30, "tail must be dropped");
    let pagination = &payload["pagination"];
    assert_eq!(pagination["has_more"], true);
    assert_eq!(pagination["page_size"], results.len());
    if !results.is_empty() {
        assert_eq!(pagination["next_offset"], results.len());
    }
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_empty_query_rejected() {
    let (server, store, _dir) = server_without_embedder().await;
    let response = server
        .handle_request(tool_call("search_regex", json!({"pattern": "  "})))
        .await;
    assert!(response.error.is_some());
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_notification_gets_no_response_body() {
    let (server, store, _dir) = server_without_embedder().await;
    let notification: JsonRpcRequest = serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "method": "initialized"
    }))
    .unwrap();
    let response = server.handle_request(notification).await;
    assert!(response.is_notification_ack());
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_idempotent() {
    let (server, _store, _dir) = server_without_embedder().await;
    server.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}
