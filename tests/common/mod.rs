//! Shared fixtures: deterministic mock providers and store builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use chunkhound::config::IndexingConfig;
use chunkhound::embedding::{
    EmbedError, EmbeddingProvider, EmbeddingProviderRegistry, RerankResult,
};
use chunkhound::indexing::IndexingCoordinator;
use chunkhound::llm::{CompletionProvider, LlmError};
use chunkhound::parser::ParserRegistry;
use chunkhound::search::SearchService;
use chunkhound::store::{NewChunk, NewEmbedding, NewFile, StorageEngine};
use chunkhound::{ChunkType, Language};

pub const TEST_DIMS: usize = 8;
pub const TEST_PROVIDER: &str = "mock";
pub const TEST_MODEL: &str = "mock-embed-v1";

/// Deterministic embedding derived from text bytes: similar texts do not
/// cluster meaningfully, but identical text always maps to the same
/// normalized vector, which is all the tests need.
pub fn mock_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; TEST_DIMS];
    for (i, b) in text.bytes().enumerate() {
        v[i % TEST_DIMS] += (b as f32) * ((i % 7) as f32 + 1.0);
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Embedding provider producing [`mock_vector`] embeddings, with a word
/// overlap reranker.
pub struct MockEmbedder {
    pub rerank_supported: bool,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            rerank_supported: true,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn name(&self) -> &str {
        TEST_PROVIDER
    }

    fn model(&self) -> &str {
        TEST_MODEL
    }

    fn dims(&self) -> usize {
        TEST_DIMS
    }

    fn batch_size(&self) -> usize {
        4
    }

    fn max_concurrent_batches(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| mock_vector(t)).collect())
    }

    fn supports_reranking(&self) -> bool {
        self.rerank_supported
    }

    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RerankResult>, EmbedError> {
        let query_words: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let mut scored: Vec<RerankResult> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let doc_lower = doc.to_lowercase();
                let hits = query_words
                    .iter()
                    .filter(|w| doc_lower.contains(w.as_str()))
                    .count();
                let score = if query_words.is_empty() {
                    0.0
                } else {
                    (hits as f32 / query_words.len() as f32).min(1.0)
                };
                RerankResult { index, score }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// An embedding provider that always fails; used for retry/failure paths.
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn name(&self) -> &str {
        "failing"
    }
    fn model(&self) -> &str {
        "failing-model"
    }
    fn dims(&self) -> usize {
        TEST_DIMS
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Err(EmbedError::Provider("simulated outage".into()))
    }
}

/// Scripted completion provider: rules map a prompt substring to a canned
/// response; unmatched prompts get the default. Calls are recorded.
pub struct MockCompleter {
    rules: Vec<(String, String)>,
    default: String,
    pub calls: Mutex<Vec<String>>,
}

impl MockCompleter {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default: default.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rule(mut self, contains: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push((contains.into(), response.into()));
        self
    }
}

#[async_trait]
impl CompletionProvider for MockCompleter {
    fn name(&self) -> &str {
        "mock-llm"
    }

    async fn complete(
        &self,
        prompt: &str,
        _system: &str,
        _max_tokens: usize,
    ) -> Result<String, LlmError> {
        self.calls.lock().unwrap().push(prompt.to_string());
        for (needle, response) in &self.rules {
            if prompt.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self.default.clone())
    }
}

/// A connected store in a fresh temp dir. Keep the TempDir alive for the
/// duration of the test.
pub async fn temp_store() -> (Arc<StorageEngine>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = StorageEngine::connect(&dir.path().join("db")).await.unwrap();
    (Arc::new(store), dir)
}

/// Insert a file row with sensible defaults.
pub async fn seed_file(store: &StorageEngine, path: &str, language: Language) -> i64 {
    store
        .insert_file(&NewFile {
            path: path.to_string(),
            name: Path::new(path)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned(),
            extension: Path::new(path)
                .extension()
                .map(|e| e.to_string_lossy().into_owned()),
            size: 100,
            modified_time: 1_700_000_000.0,
            language,
            checksum: None,
        })
        .await
        .unwrap()
}

/// Insert a chunk with the given code on the given file.
pub async fn seed_chunk(store: &StorageEngine, file_id: i64, code: &str, start_line: i64) -> i64 {
    store
        .insert_chunk(&NewChunk {
            file_id,
            chunk_type: ChunkType::Function,
            symbol: Some(format!("fn_at_{}", start_line)),
            code: code.to_string(),
            start_line,
            end_line: start_line + 4,
            start_byte: start_line * 100,
            end_byte: start_line * 100 + code.len() as i64,
            signature: None,
            language: Language::Python,
        })
        .await
        .unwrap()
}

/// Insert an embedding for a chunk under the mock provider/model.
pub async fn seed_embedding(store: &StorageEngine, chunk_id: i64, text: &str) {
    store
        .insert_embeddings_batch(
            &[NewEmbedding {
                chunk_id,
                provider: TEST_PROVIDER.to_string(),
                model: TEST_MODEL.to_string(),
                vector: mock_vector(text),
            }],
            None,
        )
        .await
        .unwrap();
}

/// Coordinator over a store with the heuristic parser and no embedder.
pub fn coordinator_for(store: Arc<StorageEngine>) -> IndexingCoordinator {
    IndexingCoordinator::new(
        store,
        Arc::new(ParserRegistry::new()),
        None,
        IndexingConfig::default(),
    )
}

/// Search service backed by a registry containing the mock embedder.
pub fn search_with_mock_embedder(store: Arc<StorageEngine>) -> Arc<SearchService> {
    let mut registry = EmbeddingProviderRegistry::new();
    registry.register(Arc::new(MockEmbedder::new()));
    Arc::new(SearchService::new(store, Arc::new(registry)))
}

/// Write files into a temp project tree.
pub fn write_project(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (rel, content) in files {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    dir
}

/// Map of path → content for quick research-test assertions.
pub fn contents_of(dir: &TempDir, files: &[&str]) -> HashMap<String, PathBuf> {
    files
        .iter()
        .map(|rel| (rel.to_string(), dir.path().join(rel)))
        .collect()
}
