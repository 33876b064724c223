//! Request parameter validation shared by the MCP tools.

use super::types::ProtocolError;

/// Upper bound on query/pattern length from untrusted clients.
pub const MAX_QUERY_LENGTH: usize = 10_000;

/// Reject empty or absurdly long query strings.
pub fn validate_query_length(query: &str) -> Result<(), ProtocolError> {
    if query.trim().is_empty() {
        return Err(ProtocolError::InvalidParams("query must not be empty".into()));
    }
    if query.len() > MAX_QUERY_LENGTH {
        return Err(ProtocolError::InvalidParams(format!(
            "query too long ({} chars, max {})",
            query.len(),
            MAX_QUERY_LENGTH
        )));
    }
    Ok(())
}

/// Offsets below zero cannot be expressed in the wire type; a missing
/// offset is 0.
pub fn clamp_offset(offset: Option<usize>) -> usize {
    offset.unwrap_or(0)
}
