//! Search tools: regex and semantic.

use std::time::Duration;

use serde_json::{json, Value};

use crate::embedding::EmbedError;
use crate::mcp::limits::{clamp_response_tokens, limit_response_size};
use crate::mcp::types::{ProtocolError, SearchRegexArgs, SearchSemanticArgs};
use crate::mcp::validation::{clamp_offset, validate_query_length};
use crate::mcp::McpServer;
use crate::search::clamp_page_size;
use crate::Error;

use super::tool_text_result;

/// Budget for generating the query embedding. A slow provider turns into a
/// retryable error, never a hung server.
const QUERY_EMBED_TIMEOUT: Duration = Duration::from_secs(12);

pub(crate) async fn tool_search_regex(
    server: &McpServer,
    arguments: Value,
) -> Result<Value, Error> {
    let args: SearchRegexArgs = serde_json::from_value(arguments)
        .map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;
    validate_query_length(&args.pattern)?;

    let page_size = clamp_page_size(args.page_size.unwrap_or(10));
    let offset = clamp_offset(args.offset);
    let max_tokens = clamp_response_tokens(args.max_response_tokens);

    let (rows, pagination) = server
        .search
        .search_regex(&args.pattern, page_size, offset, args.path.as_deref())
        .await?;
    let (rows, pagination) = limit_response_size(rows, pagination, max_tokens);

    tool_text_result(&json!({"results": rows, "pagination": pagination}))
}

pub(crate) async fn tool_search_semantic(
    server: &McpServer,
    arguments: Value,
) -> Result<Value, Error> {
    let args: SearchSemanticArgs = serde_json::from_value(arguments)
        .map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;
    validate_query_length(&args.query)?;

    let page_size = clamp_page_size(args.page_size.unwrap_or(10));
    let offset = clamp_offset(args.offset);
    let max_tokens = clamp_response_tokens(args.max_response_tokens);

    let embedder = server.embedders.get(args.provider.as_deref())?;
    let provider = args
        .provider
        .clone()
        .unwrap_or_else(|| embedder.name().to_string());
    let model = args
        .model
        .clone()
        .unwrap_or_else(|| embedder.model().to_string());

    let query_text = vec![args.query.clone()];
    let vectors = match tokio::time::timeout(QUERY_EMBED_TIMEOUT, embedder.embed(&query_text))
        .await
    {
        Ok(result) => result?,
        Err(_) => {
            return Err(EmbedError::Timeout(QUERY_EMBED_TIMEOUT.as_secs()).into());
        }
    };
    let Some(query_vector) = vectors.into_iter().next() else {
        return Err(EmbedError::Provider("provider returned no embedding".into()).into());
    };

    let (rows, pagination) = server
        .search
        .search_semantic_vector(
            &query_vector,
            &provider,
            &model,
            page_size,
            offset,
            args.threshold,
            args.path.as_deref(),
            false,
        )
        .await?;
    let (rows, pagination) = limit_response_size(rows, pagination, max_tokens);

    tool_text_result(&json!({"results": rows, "pagination": pagination}))
}
