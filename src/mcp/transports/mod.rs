//! MCP transports. Both expose identical JSON-RPC semantics; only the
//! framing differs.

mod http;
mod stdio;

pub use http::serve_http;
pub use stdio::serve_stdio;
