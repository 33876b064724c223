//! Row types, errors, and conversion helpers for the storage engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::parser::{ChunkType, Language};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid regex pattern: {0}")]
    InvalidPattern(String),
    #[error("path filter contains forbidden pattern: {0}")]
    PathFilter(String),
    #[error("vector index error: {0}")]
    VectorIndex(#[from] crate::hnsw::HnswError),
    #[error("dimension mismatch: vector has {actual} values, table expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("not connected")]
    NotConnected,
    #[error("WAL recovery failed: {0}")]
    WalRecovery(String),
}

/// A file row.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub extension: Option<String>,
    pub size: i64,
    /// Seconds since the epoch, fractional.
    pub modified_time: f64,
    pub language: Language,
    pub checksum: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Data for inserting/upserting a file row.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub path: String,
    pub name: String,
    pub extension: Option<String>,
    pub size: i64,
    pub modified_time: f64,
    pub language: Language,
    pub checksum: Option<String>,
}

/// A chunk row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: i64,
    pub file_id: i64,
    pub chunk_type: ChunkType,
    pub symbol: Option<String>,
    pub code: String,
    pub start_line: i64,
    pub end_line: i64,
    pub start_byte: i64,
    pub end_byte: i64,
    pub size: i64,
    pub signature: Option<String>,
    pub language: Language,
}

/// Data for inserting a chunk row. `size` is derived from `code`.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub file_id: i64,
    pub chunk_type: ChunkType,
    pub symbol: Option<String>,
    pub code: String,
    pub start_line: i64,
    pub end_line: i64,
    pub start_byte: i64,
    pub end_byte: i64,
    pub signature: Option<String>,
    pub language: Language,
}

impl NewChunk {
    pub fn from_parsed(file_id: i64, chunk: &crate::parser::ParsedChunk) -> Self {
        Self {
            file_id,
            chunk_type: chunk.chunk_type,
            symbol: chunk.symbol.clone(),
            code: chunk.code.clone(),
            start_line: chunk.start_line as i64,
            end_line: chunk.end_line as i64,
            start_byte: chunk.start_byte as i64,
            end_byte: chunk.end_byte as i64,
            signature: chunk.signature.clone(),
            language: chunk.language,
        }
    }
}

/// An embedding row.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub chunk_id: i64,
    pub provider: String,
    pub model: String,
    pub vector: Vec<f32>,
    pub dims: i64,
    pub created_at: String,
}

/// Data for inserting an embedding row.
#[derive(Debug, Clone)]
pub struct NewEmbedding {
    pub chunk_id: i64,
    pub provider: String,
    pub model: String,
    pub vector: Vec<f32>,
}

/// One search hit with its file context. `similarity` is present only for
/// semantic search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRow {
    pub chunk_id: i64,
    pub symbol: Option<String>,
    pub content: String,
    pub chunk_type: String,
    pub start_line: i64,
    pub end_line: i64,
    pub file_path: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

/// Pagination metadata returned alongside result rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub page_size: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<usize>,
    pub total: usize,
}

impl Pagination {
    /// Pagination for one page out of `total` matches.
    pub fn new(offset: usize, page_size: usize, total: usize) -> Self {
        let has_more = offset + page_size < total;
        Self {
            offset,
            page_size,
            has_more,
            next_offset: has_more.then_some(offset + page_size),
            total,
        }
    }

    pub fn empty(offset: usize, page_size: usize) -> Self {
        Self {
            offset,
            page_size,
            has_more: false,
            next_offset: None,
            total: 0,
        }
    }
}

/// Aggregate store statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub files: u64,
    pub chunks: u64,
    pub embeddings: u64,
    pub providers: u64,
}

/// Statistics for a single provider/model pair.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub provider: String,
    pub model: String,
    pub embeddings: u64,
    pub files: u64,
    pub dimensions: u64,
}

/// Catalog entry for a vector index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorIndexDescriptor {
    pub index_name: String,
    pub provider: String,
    pub model: String,
    pub dims: usize,
    pub metric: String,
}

/// Health snapshot for the storage engine.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub provider: &'static str,
    pub connected: bool,
    pub db_path: String,
    pub tables: Vec<String>,
    pub errors: Vec<String>,
}

// ===== Embedding serialization =====

/// Serialize a vector as little-endian f32 bytes.
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize little-endian f32 bytes back into a vector.
pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            // SAFETY: chunks_exact(4) guarantees exactly 4 bytes per chunk
            f32::from_le_bytes(chunk.try_into().expect("chunks_exact guarantees 4 bytes"))
        })
        .collect()
}

/// Cosine similarity with SIMD acceleration and a scalar fallback for
/// unsupported architectures or mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    use simsimd::SpatialSimilarity;
    if let Some(distance) = f32::cosine(a, b) {
        return (1.0 - distance) as f32;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

// ===== Path filter =====

/// Characters and fragments rejected in user-supplied path filters.
const FORBIDDEN_PATH_PATTERNS: &[&str] = &["..", "~", "*", "?", "[", "]", "\0", "\n", "\r"];

/// Validate and normalize a user-supplied path filter.
///
/// Rules: trim whitespace; reject traversal and shell metacharacters;
/// normalize `\` to `/`; strip leading slashes; append a trailing `/` when
/// the last segment has no dot (directory pattern). Returns `None` for an
/// empty filter. The result is applied as `file.path LIKE '%/<filter>%'`.
pub fn normalize_path_filter(raw: &str) -> Result<Option<String>, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    for pattern in FORBIDDEN_PATH_PATTERNS {
        if trimmed.contains(pattern) {
            return Err(ConfigError::PathFilter(pattern.escape_default().to_string()));
        }
    }

    let mut normalized = trimmed.replace('\\', "/");
    normalized = normalized.trim_start_matches('/').to_string();
    if normalized.is_empty() {
        return Ok(None);
    }

    let last_segment = normalized.rsplit('/').next().unwrap_or("");
    if !last_segment.is_empty() && !last_segment.contains('.') && !normalized.ends_with('/') {
        normalized.push('/');
    }

    Ok(Some(normalized))
}

/// Embedding table name for a dimension count.
pub fn embedding_table_name(dims: usize) -> String {
    format!("embeddings_{}", dims)
}

/// Parse the dimension count out of an embedding table name.
pub fn dims_from_table_name(table: &str) -> Option<usize> {
    table.strip_prefix("embeddings_")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_vector_bytes_roundtrip() {
        let v = vec![0.1f32, -2.5, 3.75, 0.0, f32::MIN_POSITIVE];
        let bytes = vector_to_bytes(&v);
        assert_eq!(bytes.len(), v.len() * 4);
        assert_eq!(bytes_to_vector(&bytes), v);
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![0.6f32, 0.8];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-5);
    }

    #[test]
    fn test_path_filter_basic() {
        assert_eq!(
            normalize_path_filter("src/").unwrap(),
            Some("src/".to_string())
        );
        assert_eq!(
            normalize_path_filter("src/main.rs").unwrap(),
            Some("src/main.rs".to_string())
        );
    }

    #[test]
    fn test_path_filter_appends_slash_for_directories() {
        assert_eq!(
            normalize_path_filter("src").unwrap(),
            Some("src/".to_string())
        );
        assert_eq!(
            normalize_path_filter("src/nested").unwrap(),
            Some("src/nested/".to_string())
        );
    }

    #[test]
    fn test_path_filter_normalizes_separators_and_leading_slash() {
        assert_eq!(
            normalize_path_filter("\\src\\api").unwrap(),
            Some("src/api/".to_string())
        );
        assert_eq!(
            normalize_path_filter("/src/lib.rs").unwrap(),
            Some("src/lib.rs".to_string())
        );
    }

    #[test]
    fn test_path_filter_empty() {
        assert_eq!(normalize_path_filter("").unwrap(), None);
        assert_eq!(normalize_path_filter("   ").unwrap(), None);
        assert_eq!(normalize_path_filter("///").unwrap(), None);
    }

    #[test]
    fn test_path_filter_rejects_forbidden() {
        for bad in [
            "../etc", "~/home", "src/*", "file?", "[abc]", "a\0b", "a\nb", "a\rb",
        ] {
            assert!(
                normalize_path_filter(bad).is_err(),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_pagination_math() {
        let p = Pagination::new(0, 10, 25);
        assert!(p.has_more);
        assert_eq!(p.next_offset, Some(10));
        assert_eq!(p.total, 25);

        let last = Pagination::new(20, 10, 25);
        assert!(!last.has_more);
        assert_eq!(last.next_offset, None);
    }

    #[test]
    fn test_table_name_roundtrip() {
        assert_eq!(embedding_table_name(1536), "embeddings_1536");
        assert_eq!(dims_from_table_name("embeddings_1536"), Some(1536));
        assert_eq!(dims_from_table_name("chunks"), None);
        assert_eq!(dims_from_table_name("embeddings_x"), None);
    }

    proptest! {
        /// The normalizer never panics and its output never contains a
        /// forbidden fragment or a backslash.
        #[test]
        fn prop_path_filter_output_safe(input in "\\PC{0,100}") {
            if let Ok(Some(normalized)) = normalize_path_filter(&input) {
                for pattern in FORBIDDEN_PATH_PATTERNS {
                    prop_assert!(!normalized.contains(pattern));
                }
                prop_assert!(!normalized.contains('\\'));
                prop_assert!(!normalized.starts_with('/'));
            }
        }

        #[test]
        fn prop_vector_roundtrip(v in prop::collection::vec(-1000.0f32..1000.0, 0..64)) {
            prop_assert_eq!(bytes_to_vector(&vector_to_bytes(&v)), v);
        }
    }
}
