//! Parser seam: the indexing pipeline consumes `(symbol, kind, byte range,
//! language)` chunks through the [`CodeParser`] trait and never sees how
//! they were produced.
//!
//! The crate ships [`HeuristicParser`] as the default implementation;
//! grammar-backed parsers register per-language through [`ParserRegistry`].

mod heuristic;
pub mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

pub use heuristic::HeuristicParser;
pub use types::{ChunkType, Language, ParsedChunk};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("parse failed for {path}: {message}")]
    Failed { path: String, message: String },
    #[error("file is not valid UTF-8: {0}")]
    InvalidEncoding(String),
}

/// A language-aware chunk producer.
///
/// Implementations are synchronous and CPU-bound; the indexing coordinator
/// offloads calls to a blocking worker and applies the per-file timeout.
pub trait CodeParser: Send + Sync {
    fn parse(&self, path: &Path, text: &str) -> Result<Vec<ParsedChunk>, ParseError>;
}

/// Per-language parser lookup with a universal fallback.
pub struct ParserRegistry {
    by_language: HashMap<Language, Arc<dyn CodeParser>>,
    fallback: Arc<dyn CodeParser>,
}

impl ParserRegistry {
    /// Registry with the heuristic splitter handling every language.
    pub fn new() -> Self {
        Self {
            by_language: HashMap::new(),
            fallback: Arc::new(HeuristicParser::new()),
        }
    }

    /// Register a parser for one language, replacing any previous one.
    pub fn register(&mut self, language: Language, parser: Arc<dyn CodeParser>) {
        self.by_language.insert(language, parser);
    }

    /// Parser responsible for a given language.
    pub fn parser_for(&self, language: Language) -> Arc<dyn CodeParser> {
        self.by_language
            .get(&language)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Parse a file's text with the parser registered for its language.
    pub fn parse(&self, path: &Path, text: &str) -> Result<Vec<ParsedChunk>, ParseError> {
        let language = Language::from_path(path);
        self.parser_for(language).parse(path, text)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}
