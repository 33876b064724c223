//! Embedding generation service.
//!
//! Takes chunk ids that may lack embeddings, subtracts the ones already
//! stored, and fills the gap: batched provider calls with bounded
//! concurrency and retry, dims auto-detection on the first response, and a
//! bulk-load write path for large runs.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::Semaphore;

use crate::hnsw::DistanceMetric;
use crate::store::{NewEmbedding, StorageEngine};

use super::{EmbedError, EmbeddingProvider};

/// Provider retry policy: attempts and exponential backoff base.
const MAX_EMBED_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_JITTER_MS: u64 = 250;

/// Above this many vectors, writes go through the bulk index-management
/// path so the HNSW graphs are rebuilt once instead of extended per batch.
const BULK_WRITE_THRESHOLD: usize = 1000;

/// Outcome of one [`EmbeddingService::embed_chunks`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub requested: usize,
    pub already_embedded: usize,
    pub embedded: usize,
    pub failed_batches: usize,
}

/// Generates and persists embeddings for chunks.
pub struct EmbeddingService {
    store: Arc<StorageEngine>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingService {
    pub fn new(store: Arc<StorageEngine>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, provider }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Ensure every requested chunk has exactly one embedding row for this
    /// provider/model. Per-batch provider failures are reported in the
    /// result, never propagated — successful batches always persist.
    pub async fn embed_chunks(&self, chunk_ids: &[i64]) -> Result<EmbedReport, EmbedError> {
        let mut report = EmbedReport {
            requested: chunk_ids.len(),
            ..Default::default()
        };
        if chunk_ids.is_empty() {
            return Ok(report);
        }

        let provider_name = self.provider.name().to_string();
        let model = self.provider.model().to_string();

        let existing = self
            .store
            .get_existing_embeddings(chunk_ids, &provider_name, &model)
            .await?;
        report.already_embedded = existing.len();

        let missing: Vec<i64> = chunk_ids
            .iter()
            .copied()
            .filter(|id| !existing.contains(id))
            .collect();
        if missing.is_empty() {
            return Ok(report);
        }

        let codes = self.store.get_chunk_codes(&missing).await?;
        if codes.is_empty() {
            return Ok(report);
        }

        let batch_size = self.provider.batch_size().max(1);
        let semaphore = Arc::new(Semaphore::new(self.provider.max_concurrent_batches().max(1)));

        let batch_futures = codes.chunks(batch_size).map(|batch| {
            let semaphore = Arc::clone(&semaphore);
            let provider = Arc::clone(&self.provider);
            let batch: Vec<(i64, String)> = batch.to_vec();
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                let texts: Vec<String> = batch.iter().map(|(_, code)| code.clone()).collect();
                match embed_with_retry(provider.as_ref(), &texts).await {
                    Ok(vectors) => Some((batch, vectors)),
                    Err(e) => {
                        tracing::warn!(error = %e, batch = batch.len(), "Embedding batch failed");
                        None
                    }
                }
            }
        });

        let outcomes = join_all(batch_futures).await;

        // Dims are auto-detected from the first successful batch when the
        // provider does not declare them.
        let declared_dims = self.provider.dims();
        let mut detected_dims: Option<usize> = None;
        let mut to_insert: Vec<NewEmbedding> = Vec::new();

        for outcome in outcomes {
            let Some((batch, vectors)) = outcome else {
                report.failed_batches += 1;
                continue;
            };
            if vectors.len() != batch.len() {
                tracing::warn!(
                    expected = batch.len(),
                    actual = vectors.len(),
                    "Provider returned wrong vector count, dropping batch"
                );
                report.failed_batches += 1;
                continue;
            }

            let mut batch_ok = true;
            for ((chunk_id, _), vector) in batch.iter().zip(&vectors) {
                let dims = *detected_dims.get_or_insert(vector.len());
                if vector.len() != dims || (declared_dims != 0 && vector.len() != declared_dims) {
                    tracing::warn!(
                        chunk_id = *chunk_id,
                        expected = if declared_dims != 0 { declared_dims } else { dims },
                        actual = vector.len(),
                        "Vector dimension mismatch, dropping batch"
                    );
                    batch_ok = false;
                    break;
                }
            }
            if !batch_ok {
                report.failed_batches += 1;
                continue;
            }

            to_insert.extend(batch.into_iter().zip(vectors).map(|((chunk_id, _), vector)| {
                NewEmbedding {
                    chunk_id,
                    provider: provider_name.clone(),
                    model: model.clone(),
                    vector,
                }
            }));
        }

        if to_insert.is_empty() {
            return Ok(report);
        }

        let dims = detected_dims.unwrap_or(declared_dims);
        self.ensure_index_exists(dims).await?;

        if to_insert.len() > BULK_WRITE_THRESHOLD {
            let embeddings = to_insert;
            report.embedded = self
                .store
                .bulk_operation_with_index_management(move |conn| {
                    Box::pin(async move {
                        crate::store::embeddings::insert_embeddings_on(conn, &embeddings, 500)
                            .await
                    })
                })
                .await?;
        } else {
            report.embedded = self.store.insert_embeddings_batch(&to_insert, None).await?;
        }

        tracing::info!(
            embedded = report.embedded,
            skipped = report.already_embedded,
            failed_batches = report.failed_batches,
            "Embedding run complete"
        );
        Ok(report)
    }

    /// Create the per-dims table and vector index on first use.
    async fn ensure_index_exists(&self, dims: usize) -> Result<(), EmbedError> {
        if dims == 0 {
            return Ok(());
        }
        self.store.ensure_embedding_table(dims).await?;

        let provider = self.provider.name();
        let model = self.provider.model();
        let have_index = self
            .store
            .get_existing_vector_indexes()
            .await?
            .iter()
            .any(|d| d.provider == provider && d.model == model && d.dims == dims);
        if !have_index {
            self.store
                .create_vector_index(provider, model, dims, DistanceMetric::Cosine)
                .await?;
        }
        Ok(())
    }
}

/// Call the provider with exponential backoff and jitter. Timeouts and
/// provider errors are retried; the final failure is returned.
async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let mut last_error = None;
    for attempt in 0..MAX_EMBED_ATTEMPTS {
        if attempt > 0 {
            let backoff = BACKOFF_BASE_MS * (1 << (attempt - 1));
            let jitter = rand::rng().random_range(0..BACKOFF_JITTER_MS);
            tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
        }
        match provider.embed(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) => {
                tracing::debug!(attempt = attempt + 1, error = %e, "Embed attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| EmbedError::Provider("no attempts made".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingProvider;
    use crate::parser::{ChunkType, Language};
    use crate::store::{NewChunk, NewFile};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        dims: usize,
        calls: AtomicUsize,
        fail_always: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }
        fn model(&self) -> &str {
            "counting-model"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        fn batch_size(&self) -> usize {
            2
        }
        fn max_concurrent_batches(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_always {
                return Err(EmbedError::Provider("down".into()));
            }
            Ok(texts.iter().map(|_| vec![0.5f32; 4]).collect())
        }
    }

    async fn store_with_chunks(count: usize) -> (Arc<StorageEngine>, Vec<i64>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(StorageEngine::connect(&dir.path().join("db")).await.unwrap());
        let file_id = store
            .insert_file(&NewFile {
                path: "/proj/e.py".into(),
                name: "e.py".into(),
                extension: Some("py".into()),
                size: 10,
                modified_time: 0.0,
                language: Language::Python,
                checksum: None,
            })
            .await
            .unwrap();
        let chunks: Vec<NewChunk> = (0..count)
            .map(|i| NewChunk {
                file_id,
                chunk_type: ChunkType::Function,
                symbol: Some(format!("f{}", i)),
                code: format!("def f{}(): pass", i),
                start_line: i as i64 + 1,
                end_line: i as i64 + 1,
                start_byte: 0,
                end_byte: 10,
                signature: None,
                language: Language::Python,
            })
            .collect();
        let ids = store.insert_chunks_batch(&chunks).await.unwrap();
        (store, ids, dir)
    }

    #[tokio::test]
    async fn test_embed_chunks_fills_missing_only() {
        let (store, ids, _dir) = store_with_chunks(5).await;
        let provider = Arc::new(CountingProvider {
            dims: 4,
            calls: AtomicUsize::new(0),
            fail_always: false,
        });
        let service = EmbeddingService::new(Arc::clone(&store), provider.clone());

        let report = service.embed_chunks(&ids).await.unwrap();
        assert_eq!(report.requested, 5);
        assert_eq!(report.already_embedded, 0);
        assert_eq!(report.embedded, 5);
        assert_eq!(report.failed_batches, 0);
        // batch_size 2 → 3 provider calls.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        // Second run: everything already embedded, provider untouched.
        let report = service.embed_chunks(&ids).await.unwrap();
        assert_eq!(report.already_embedded, 5);
        assert_eq!(report.embedded, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        // A vector index was created for the detected dims.
        let descriptors = store.get_existing_vector_indexes().await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].dims, 4);
        store.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_embed_chunks_reports_failed_batches() {
        let (store, ids, _dir) = store_with_chunks(3).await;
        let provider = Arc::new(CountingProvider {
            dims: 4,
            calls: AtomicUsize::new(0),
            fail_always: true,
        });
        let service = EmbeddingService::new(Arc::clone(&store), provider.clone());

        let report = service.embed_chunks(&ids).await.unwrap();
        assert_eq!(report.embedded, 0);
        assert_eq!(report.failed_batches, 2, "both batches fail");
        // Each batch retries MAX_EMBED_ATTEMPTS times.
        assert_eq!(
            provider.calls.load(Ordering::SeqCst),
            2 * MAX_EMBED_ATTEMPTS as usize
        );
        assert_eq!(store.get_stats().await.unwrap().embeddings, 0);
        store.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_embed_chunks_empty_input() {
        let (store, _ids, _dir) = store_with_chunks(1).await;
        let provider = Arc::new(CountingProvider {
            dims: 4,
            calls: AtomicUsize::new(0),
            fail_always: false,
        });
        let service = EmbeddingService::new(Arc::clone(&store), provider);
        let report = service.embed_chunks(&[]).await.unwrap();
        assert_eq!(report, EmbedReport::default());
        store.disconnect().await.unwrap();
    }
}
