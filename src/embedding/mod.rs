//! Embedding-provider seam and registry.
//!
//! Concrete HTTP clients (OpenAI, VoyageAI, Ollama, TEI, ...) implement
//! [`EmbeddingProvider`] outside the crate. The registry owns one boxed
//! provider per name and designates a default; it is created during server
//! startup and passed explicitly wherever embeddings are needed.

mod service;

pub use service::{EmbedReport, EmbeddingService};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::store::StorageError;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("embedding provider error: {0}")]
    Provider(String),
    #[error("embedding request timed out after {0}s")]
    Timeout(u64),
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no embedding provider registered{}", .0.as_ref().map(|n| format!(": {}", n)).unwrap_or_default())]
    NoProvider(Option<String>),
    #[error("provider does not support reranking")]
    RerankUnsupported,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One reranked document: its position in the input list plus a relevance
/// score in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankResult {
    pub index: usize,
    pub score: f32,
}

/// A dense-embedding producer for a fixed provider/model pair.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    /// Declared vector length; 0 means auto-detect from the first response.
    fn dims(&self) -> usize;

    fn batch_size(&self) -> usize {
        100
    }

    fn max_concurrent_batches(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    fn supports_reranking(&self) -> bool {
        false
    }

    /// Score `documents` against `query`, best first, at most `top_k`.
    async fn rerank(
        &self,
        _query: &str,
        _documents: &[String],
        _top_k: usize,
    ) -> Result<Vec<RerankResult>, EmbedError> {
        Err(EmbedError::RerankUnsupported)
    }
}

/// Owns the process's embedding providers. The first registration becomes
/// the default.
#[derive(Default)]
pub struct EmbeddingProviderRegistry {
    providers: HashMap<String, Arc<dyn EmbeddingProvider>>,
    default_name: Option<String>,
}

impl EmbeddingProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        let name = provider.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    /// Resolve a provider by name, or the default when `name` is `None`.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn EmbeddingProvider>, EmbedError> {
        let resolved = match name {
            Some(n) => n,
            None => self
                .default_name
                .as_deref()
                .ok_or(EmbedError::NoProvider(None))?,
        };
        self.providers
            .get(resolved)
            .cloned()
            .ok_or_else(|| EmbedError::NoProvider(Some(resolved.to_string())))
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
