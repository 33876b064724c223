//! In-process HNSW vector indexes.
//!
//! One index exists per `(provider, model, dims, metric)` combination,
//! mirroring the dimension-partitioned embedding tables. Indexes live in
//! memory and are rebuilt from table contents on connect; the storage
//! engine's `vector_indexes` catalog makes the descriptors durable.

use std::fmt;
use std::str::FromStr;

use hnsw_rs::anndists::dist::distances::{DistCosine, DistL2};
use hnsw_rs::api::AnnT;
use hnsw_rs::hnsw::Hnsw;
use thiserror::Error;

// HNSW tuning for code-search workloads (10k-100k chunks):
// M=24 connectivity, ef_construction=200 one-time build cost,
// ef_search=100 interactive accuracy/speed tradeoff.
pub(crate) const MAX_NB_CONNECTION: usize = 24;
pub(crate) const MAX_LAYER: usize = 16;
pub(crate) const EF_CONSTRUCTION: usize = 200;
pub(crate) const EF_SEARCH: usize = 100;

#[derive(Error, Debug)]
pub enum HnswError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("unknown distance metric: {0}")]
    UnknownMetric(String),
}

/// Distance metric for a vector index. Cosine is the default everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistanceMetric {
    Cosine,
    L2,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::L2 => write!(f, "l2"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = HnswError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(DistanceMetric::Cosine),
            "l2" => Ok(DistanceMetric::L2),
            other => Err(HnswError::UnknownMetric(other.to_string())),
        }
    }
}

/// Identity of one vector index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VectorIndexKey {
    pub provider: String,
    pub model: String,
    pub dims: usize,
    pub metric: DistanceMetric,
}

impl VectorIndexKey {
    /// Physical index name, e.g. `hnsw_openai_text_embedding_3_small_1536_cosine`.
    pub fn index_name(&self) -> String {
        format!(
            "hnsw_{}_{}_{}_{}",
            self.provider, self.model, self.dims, self.metric
        )
        .replace(['-', '.'], "_")
    }
}

enum Graph {
    Cosine(Hnsw<'static, f32, DistCosine>),
    L2(Hnsw<'static, f32, DistL2>),
}

impl std::fmt::Debug for HnswVectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswVectorIndex")
            .field("dims", &self.dims)
            .field("len", &self.id_map.len())
            .finish()
    }
}

/// HNSW index mapping internal sequential ids to chunk ids.
pub struct HnswVectorIndex {
    graph: Graph,
    id_map: Vec<i64>,
    dims: usize,
}

impl HnswVectorIndex {
    /// Build an index from `(chunk_id, vector)` pairs.
    pub fn build(
        dims: usize,
        metric: DistanceMetric,
        items: &[(i64, Vec<f32>)],
    ) -> Result<Self, HnswError> {
        for (_, v) in items {
            if v.len() != dims {
                return Err(HnswError::DimensionMismatch {
                    expected: dims,
                    actual: v.len(),
                });
            }
        }

        let capacity = items.len().max(1);
        let graph = match metric {
            DistanceMetric::Cosine => Graph::Cosine(Hnsw::new(
                MAX_NB_CONNECTION,
                capacity,
                MAX_LAYER,
                EF_CONSTRUCTION,
                DistCosine,
            )),
            DistanceMetric::L2 => Graph::L2(Hnsw::new(
                MAX_NB_CONNECTION,
                capacity,
                MAX_LAYER,
                EF_CONSTRUCTION,
                DistL2,
            )),
        };

        let mut index = Self {
            graph,
            id_map: Vec::with_capacity(items.len()),
            dims,
        };
        index.insert_batch(items)?;
        tracing::debug!(vectors = index.len(), dims, %metric, "HNSW index built");
        Ok(index)
    }

    /// Append vectors to the index. Chunk ids may repeat across calls; the
    /// newest insertion simply adds another graph node for that chunk.
    pub fn insert_batch(&mut self, items: &[(i64, Vec<f32>)]) -> Result<usize, HnswError> {
        if items.is_empty() {
            return Ok(0);
        }
        for (_, v) in items {
            if v.len() != self.dims {
                return Err(HnswError::DimensionMismatch {
                    expected: self.dims,
                    actual: v.len(),
                });
            }
        }

        let base_idx = self.id_map.len();
        let data_for_insert: Vec<(&Vec<f32>, usize)> = items
            .iter()
            .enumerate()
            .map(|(i, (_, v))| (v, base_idx + i))
            .collect();

        match &mut self.graph {
            Graph::Cosine(h) => h.parallel_insert_data(&data_for_insert),
            Graph::L2(h) => h.parallel_insert_data(&data_for_insert),
        }
        self.id_map.extend(items.iter().map(|(id, _)| *id));
        Ok(items.len())
    }

    /// Nearest neighbors as `(chunk_id, similarity)` sorted by descending
    /// similarity. Cosine similarity is `1 - distance`; L2 distances map to
    /// `1 / (1 + distance)` so higher is always better.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        if self.id_map.is_empty() || k == 0 {
            return Vec::new();
        }
        if query.len() != self.dims {
            tracing::warn!(
                expected = self.dims,
                actual = query.len(),
                "Query dimension mismatch"
            );
            return Vec::new();
        }

        // Adaptive ef_search: baseline or 2*k, capped at index size.
        let ef_search = EF_SEARCH.max(k * 2).min(self.id_map.len().max(EF_SEARCH));

        let neighbours = match &self.graph {
            Graph::Cosine(h) => h.search_neighbours(query, k, ef_search),
            Graph::L2(h) => h.search_neighbours(query, k, ef_search),
        };

        let to_similarity = |d: f32| match self.graph {
            Graph::Cosine(_) => 1.0 - d,
            Graph::L2(_) => 1.0 / (1.0 + d),
        };

        neighbours
            .into_iter()
            .filter_map(|n| {
                let idx = n.d_id;
                if idx >= self.id_map.len() {
                    tracing::warn!(idx, "Invalid internal id in HNSW result");
                    return None;
                }
                let score = to_similarity(n.distance);
                if !score.is_finite() {
                    return None;
                }
                Some((self.id_map[idx], score))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.id_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_map.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }
}

#[cfg(test)]
pub(crate) fn make_test_vector(seed: u32, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    for (i, val) in v.iter_mut().enumerate() {
        *val = ((seed as f32 * 0.1) + (i as f32 * 0.001)).sin();
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in &mut v {
            *val /= norm;
        }
    }
    v
}
