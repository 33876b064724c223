//! Search service: parameter clamping, query embedding, and the multi-hop
//! semantic strategy on top of the storage engine's search operations.

use std::sync::Arc;

use crate::embedding::EmbeddingProviderRegistry;
use crate::store::{normalize_path_filter, Pagination, SearchRow, StorageEngine};
use crate::Error;

/// Page size bounds for both search modes.
pub const MIN_PAGE_SIZE: usize = 1;
pub const MAX_PAGE_SIZE: usize = 100;

/// Seeds taken from the first hop of a multi-hop semantic search.
const MULTI_HOP_SEEDS: usize = 3;

pub fn clamp_page_size(page_size: usize) -> usize {
    page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

pub struct SearchService {
    store: Arc<StorageEngine>,
    embedders: Arc<EmbeddingProviderRegistry>,
}

impl SearchService {
    pub fn new(store: Arc<StorageEngine>, embedders: Arc<EmbeddingProviderRegistry>) -> Self {
        Self { store, embedders }
    }

    pub fn store(&self) -> &Arc<StorageEngine> {
        &self.store
    }

    /// Regex search over chunk content. Validates the path filter before
    /// touching the store so violations surface as configuration errors.
    pub async fn search_regex(
        &self,
        pattern: &str,
        page_size: usize,
        offset: usize,
        path_filter: Option<&str>,
    ) -> Result<(Vec<SearchRow>, Pagination), Error> {
        if let Some(raw) = path_filter {
            normalize_path_filter(raw)?;
        }
        let page_size = clamp_page_size(page_size);
        let (rows, pagination) = self
            .store
            .search_regex(pattern, page_size, offset, path_filter)
            .await?;
        Ok((rows, pagination))
    }

    /// Semantic search from query text: embed, then nearest-neighbor.
    ///
    /// `provider`/`model` default to the registry's default provider.
    /// With `multi_hop`, the top first-round hits seed additional rounds
    /// and results are unioned by chunk id.
    #[allow(clippy::too_many_arguments)]
    pub async fn search_semantic(
        &self,
        query: &str,
        provider: Option<&str>,
        model: Option<&str>,
        page_size: usize,
        offset: usize,
        threshold: Option<f32>,
        path_filter: Option<&str>,
        multi_hop: bool,
    ) -> Result<(Vec<SearchRow>, Pagination), Error> {
        if let Some(raw) = path_filter {
            normalize_path_filter(raw)?;
        }
        let page_size = clamp_page_size(page_size);

        let embedder = self.embedders.get(provider)?;
        let provider_name = provider.unwrap_or(embedder.name()).to_string();
        let model_name = model.unwrap_or(embedder.model()).to_string();

        let vectors = embedder
            .embed(std::slice::from_ref(&query.to_string()))
            .await?;
        let Some(query_vector) = vectors.into_iter().next() else {
            return Ok((Vec::new(), Pagination::empty(offset, page_size)));
        };

        self.search_semantic_vector(
            &query_vector,
            &provider_name,
            &model_name,
            page_size,
            offset,
            threshold,
            path_filter,
            multi_hop,
        )
        .await
    }

    /// Semantic search from a pre-computed query vector.
    #[allow(clippy::too_many_arguments)]
    pub async fn search_semantic_vector(
        &self,
        query_vector: &[f32],
        provider: &str,
        model: &str,
        page_size: usize,
        offset: usize,
        threshold: Option<f32>,
        path_filter: Option<&str>,
        multi_hop: bool,
    ) -> Result<(Vec<SearchRow>, Pagination), Error> {
        let (rows, pagination) = self
            .store
            .search_semantic(
                query_vector,
                provider,
                model,
                page_size,
                offset,
                threshold,
                path_filter,
            )
            .await?;

        if !multi_hop || rows.is_empty() {
            return Ok((rows, pagination));
        }

        // Second hop: the top hits' own vectors become queries; hop results
        // union with the first round by chunk id, keeping the best score.
        let seeds: Vec<i64> = rows
            .iter()
            .take(MULTI_HOP_SEEDS)
            .map(|r| r.chunk_id)
            .collect();
        let mut by_id: std::collections::HashMap<i64, SearchRow> = std::collections::HashMap::new();
        for row in rows {
            by_id.insert(row.chunk_id, row);
        }
        for seed in seeds {
            let Some(embedding) = self
                .store
                .get_embedding_by_chunk_id(seed, provider, model)
                .await?
            else {
                continue;
            };
            let (hop_rows, _) = self
                .store
                .search_semantic(
                    &embedding.vector,
                    provider,
                    model,
                    page_size,
                    0,
                    threshold,
                    path_filter,
                )
                .await?;
            for row in hop_rows {
                by_id
                    .entry(row.chunk_id)
                    .and_modify(|existing| {
                        if row.similarity > existing.similarity {
                            existing.similarity = row.similarity;
                        }
                    })
                    .or_insert(row);
            }
        }

        let mut merged: Vec<SearchRow> = by_id.into_values().collect();
        merged.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        merged.truncate(page_size);
        Ok((merged, pagination))
    }
}
