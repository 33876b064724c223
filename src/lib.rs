//! # chunkhound - Local Code Search for AI Agents
//!
//! Continuously indexes a source tree into a hybrid store of parsed code
//! chunks and dense vector embeddings, then serves two retrieval modes —
//! regex over chunk content and semantic nearest-neighbor over embeddings —
//! plus a BFS-driven deep research procedure that combines both with an
//! external LLM. An MCP protocol server (stdio or HTTP JSON-RPC) exposes
//! the search and stats operations to agents.
//!
//! ## Quick Start
//!
//! ```no_run
//! use chunkhound::config::Config;
//! use chunkhound::indexing::IndexingCoordinator;
//! use chunkhound::parser::ParserRegistry;
//! use chunkhound::store::StorageEngine;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), chunkhound::Error> {
//! let config = Config::load(Path::new("."), None, None)?;
//! let store = Arc::new(StorageEngine::connect(Path::new(".chunkhound/db")).await?);
//! let coordinator = IndexingCoordinator::new(
//!     Arc::clone(&store),
//!     Arc::new(ParserRegistry::new()),
//!     None,
//!     config.indexing.clone(),
//! );
//! coordinator.process_directory(Path::new("."), None, None).await?;
//! let (rows, _pagination) = store.search_regex("fn main", 10, 0, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod discovery;
pub mod embedding;
pub mod hnsw;
pub mod indexing;
pub mod llm;
pub mod mcp;
pub mod parser;
pub mod research;
pub mod search;
pub mod store;
pub mod watch;

pub use config::{Config, ConfigError};
pub use embedding::{EmbedError, EmbeddingProvider, EmbeddingProviderRegistry, EmbeddingService};
pub use indexing::{IndexingCoordinator, ProcessResult, ProcessStatus};
pub use llm::{estimate_tokens, CompletionProvider, LlmError};
pub use mcp::ProtocolError;
pub use parser::{ChunkType, CodeParser, Language, ParseError, ParserRegistry};
pub use research::DeepResearchEngine;
pub use search::SearchService;
pub use store::{Pagination, SearchRow, StorageEngine, StorageError};
pub use watch::RealtimeWatcher;

use std::path::Path;

/// Closed error taxonomy. Tool entry points and service boundaries return
/// this; internal helpers use their subsystem error types with `?`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("parse timed out after {0}s")]
    ParseTimeout(f64),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Embed(EmbedError),
    #[error(transparent)]
    Llm(LlmError),
    #[error("LLM call timed out after {0}s")]
    LlmTimeout(u64),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Error {
    /// Stable kind tag used in wire-level error objects.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Io(_) => "io_error",
            Error::Parse(_) => "parse_error",
            Error::ParseTimeout(_) => "parse_timeout",
            Error::Storage(_) => "storage_error",
            Error::Embed(_) => "embed_error",
            Error::Llm(_) => "llm_error",
            Error::LlmTimeout(_) => "llm_timeout",
            Error::Protocol(_) => "protocol_error",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LlmTimeout(_) | Error::Embed(EmbedError::Timeout(_))
        )
    }
}

// Path-filter violations are configuration errors at the taxonomy level
// even though the store detects them.
impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::PathFilter(pattern) => Error::Config(ConfigError::PathFilter(pattern)),
            other => Error::Storage(other),
        }
    }
}

impl From<EmbedError> for Error {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::Storage(inner) => inner.into(),
            other => Error::Embed(other),
        }
    }
}

impl From<LlmError> for Error {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Timeout(secs) => Error::LlmTimeout(secs),
            other => Error::Llm(other),
        }
    }
}

/// Relativize a path against a root and normalize separators for display.
pub fn rel_display(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_filter_maps_to_config_error() {
        let err: Error = StorageError::PathFilter("..".into()).into();
        assert!(matches!(err, Error::Config(ConfigError::PathFilter(_))));
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_llm_timeout_maps_to_dedicated_kind() {
        let err: Error = LlmError::Timeout(600).into();
        assert!(matches!(err, Error::LlmTimeout(600)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_embed_storage_error_unwraps() {
        let err: Error = EmbedError::Storage(StorageError::NotConnected).into();
        assert!(matches!(err, Error::Storage(StorageError::NotConnected)));
    }

    #[test]
    fn test_rel_display() {
        assert_eq!(
            rel_display(Path::new("/p/src/main.rs"), Path::new("/p")),
            "src/main.rs"
        );
        assert_eq!(
            rel_display(Path::new("/other/f.rs"), Path::new("/p")),
            "/other/f.rs"
        );
    }
}
