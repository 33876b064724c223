//! MCP (Model Context Protocol) server.
//!
//! # Security
//!
//! JSON deserialization from untrusted input is bounded by the HTTP
//! transport's 1MB request body limit; the stdio transport assumes a
//! trusted local client.

mod limits;
mod server;
mod tools;
mod transports;
mod types;
mod validation;

pub use limits::{
    clamp_response_tokens, limit_response_size, MAX_ALLOWED_TOKENS, MAX_RESPONSE_TOKENS,
    MIN_RESPONSE_TOKENS,
};
pub use server::{McpServer, MCP_PROTOCOL_VERSION};
pub use transports::{serve_http, serve_stdio};
pub use types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, ProtocolError};

#[cfg(test)]
mod tests {
    mod fuzz {
        use super::super::types::JsonRpcRequest;
        use proptest::prelude::*;

        proptest! {
            /// JsonRpcRequest parsing never panics on arbitrary input.
            #[test]
            fn fuzz_jsonrpc_parse_no_panic(input in "\\PC{0,1000}") {
                let _ = serde_json::from_str::<JsonRpcRequest>(&input);
            }

            /// Structured JSON-like requests parse or fail cleanly.
            #[test]
            fn fuzz_jsonrpc_structured(
                jsonrpc in "(1\\.0|2\\.0|[0-9]\\.[0-9])",
                id in prop::option::of(0i64..1000),
                method in "[a-z/_]{1,30}",
            ) {
                let json = match id {
                    Some(id) => format!(
                        r#"{{"jsonrpc":"{}","id":{},"method":"{}"}}"#,
                        jsonrpc, id, method
                    ),
                    None => format!(
                        r#"{{"jsonrpc":"{}","method":"{}"}}"#,
                        jsonrpc, method
                    ),
                };
                let _ = serde_json::from_str::<JsonRpcRequest>(&json);
            }
        }
    }
}
