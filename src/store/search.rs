//! Regex and semantic search over the chunk store.
//!
//! Regex matching runs in Rust over candidate rows (the path filter is
//! pushed down to SQL as a LIKE); semantic search scores vectors in Rust,
//! using the in-memory HNSW index as a candidate generator when no filter
//! forces an exact scan.

use std::collections::HashMap;

use regex::Regex;
use sqlx::Row;

use super::helpers::{
    bytes_to_vector, cosine_similarity, embedding_table_name, normalize_path_filter, Pagination,
    SearchRow, StorageError,
};
use super::StorageEngine;

const ROW_COLUMNS: &str = "c.id, c.symbol, c.code, c.chunk_type, c.start_line, c.end_line, \
                           f.path, f.language";

fn decode_row(row: &sqlx::sqlite::SqliteRow, similarity: Option<f32>) -> SearchRow {
    SearchRow {
        chunk_id: row.get(0),
        symbol: row.get(1),
        content: row.get(2),
        chunk_type: row.get(3),
        start_line: row.get(4),
        end_line: row.get(5),
        file_path: row.get(6),
        language: row.get(7),
        similarity,
    }
}

fn path_filter_to_like(normalized: &str) -> String {
    format!("%/{}%", normalized)
}

impl StorageEngine {
    /// Regex search over chunk content, ordered by `(file_path, start_line)`.
    ///
    /// The pattern contract is the POSIX-ERE-compatible subset of the regex
    /// crate; unsupported constructs (look-around, backreferences) fail
    /// pattern compilation.
    pub async fn search_regex(
        &self,
        pattern: &str,
        page_size: usize,
        offset: usize,
        path_filter: Option<&str>,
    ) -> Result<(Vec<SearchRow>, Pagination), StorageError> {
        let regex = Regex::new(pattern)
            .map_err(|e| StorageError::InvalidPattern(e.to_string()))?;
        let normalized = match path_filter {
            Some(raw) => normalize_path_filter(raw)
                .map_err(|_| StorageError::PathFilter(raw.to_string()))?,
            None => None,
        };

        let mut query = format!(
            "SELECT {} FROM chunks c JOIN files f ON c.file_id = f.id",
            ROW_COLUMNS
        );
        if normalized.is_some() {
            query.push_str(" WHERE f.path LIKE ?1");
        }
        query.push_str(" ORDER BY f.path, c.start_line");

        let mut q = sqlx::query(&query);
        if let Some(ref filter) = normalized {
            q = q.bind(path_filter_to_like(filter));
        }
        let rows = q.fetch_all(self.pool()).await?;

        let mut matched = Vec::new();
        for row in &rows {
            let code: &str = row.get(2);
            if regex.is_match(code) {
                matched.push(row);
            }
        }

        let total = matched.len();
        let page: Vec<SearchRow> = matched
            .into_iter()
            .skip(offset)
            .take(page_size)
            .map(|row| decode_row(row, None))
            .collect();

        let pagination = Pagination::new(offset, page_size, total);
        Ok((page, pagination))
    }

    /// Semantic nearest-neighbor search. The embedding's length selects the
    /// per-dims table; a missing table yields an empty result, not an
    /// error. Results order by `(similarity DESC, chunk_id ASC)` — the
    /// secondary key keeps equal-similarity ordering stable.
    pub async fn search_semantic(
        &self,
        query_embedding: &[f32],
        provider: &str,
        model: &str,
        page_size: usize,
        offset: usize,
        threshold: Option<f32>,
        path_filter: Option<&str>,
    ) -> Result<(Vec<SearchRow>, Pagination), StorageError> {
        let dims = query_embedding.len();
        let normalized = match path_filter {
            Some(raw) => normalize_path_filter(raw)
                .map_err(|_| StorageError::PathFilter(raw.to_string()))?,
            None => None,
        };

        if !self.table_exists(&embedding_table_name(dims)).await? {
            tracing::debug!(dims, "No embedding table for query dims");
            return Ok((Vec::new(), Pagination::empty(offset, page_size)));
        }

        // Index-accelerated path: exact scoring is only required when a
        // threshold or path filter constrains the result set.
        let unfiltered = threshold.is_none() && normalized.is_none();
        if unfiltered {
            let wanted = offset + page_size;
            if let Some(candidates) =
                self.with_index(provider, model, dims, |index| index.search(query_embedding, wanted))
            {
                let table = embedding_table_name(dims);
                let (total,): (i64,) = sqlx::query_as(&format!(
                    "SELECT COUNT(*) FROM {} WHERE provider = ?1 AND model = ?2",
                    table
                ))
                .bind(provider)
                .bind(model)
                .fetch_one(self.pool())
                .await?;

                let scored: Vec<(i64, f32)> =
                    candidates.into_iter().skip(offset).take(page_size).collect();
                let page = self.fetch_rows_for_scored(&scored).await?;
                let pagination = Pagination::new(offset, page_size, total as usize);
                return Ok((page, pagination));
            }
        }

        // Exact path: score every stored vector for this provider/model.
        let mut scored: Vec<(i64, f32)> = Vec::new();
        let table = embedding_table_name(dims);
        let mut query = format!(
            "SELECT e.chunk_id, e.embedding FROM {} e
             JOIN chunks c ON e.chunk_id = c.id
             JOIN files f ON c.file_id = f.id
             WHERE e.provider = ?1 AND e.model = ?2",
            table
        );
        if normalized.is_some() {
            query.push_str(" AND f.path LIKE ?3");
        }
        let mut q = sqlx::query_as::<_, (i64, Vec<u8>)>(&query)
            .bind(provider)
            .bind(model);
        if let Some(ref filter) = normalized {
            q = q.bind(path_filter_to_like(filter));
        }
        for (chunk_id, bytes) in q.fetch_all(self.pool()).await? {
            let vector = bytes_to_vector(&bytes);
            if vector.len() != dims {
                tracing::warn!(chunk_id, "Stored vector length mismatch, skipping");
                continue;
            }
            let similarity = cosine_similarity(query_embedding, &vector);
            if threshold.map_or(true, |t| similarity >= t) {
                scored.push((chunk_id, similarity));
            }
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let total = scored.len();
        let page_scored: Vec<(i64, f32)> =
            scored.into_iter().skip(offset).take(page_size).collect();
        let page = self.fetch_rows_for_scored(&page_scored).await?;
        let pagination = Pagination::new(offset, page_size, total);
        Ok((page, pagination))
    }

    /// Plain substring search over code and symbols (LIKE semantics). A
    /// cheap non-regex path used internally.
    pub async fn search_text(
        &self,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<SearchRow>, StorageError> {
        let like = format!("%{}%", needle);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks c JOIN files f ON c.file_id = f.id
             WHERE c.code LIKE ?1 OR c.symbol LIKE ?1
             ORDER BY f.path, c.start_line LIMIT ?2",
            ROW_COLUMNS
        ))
        .bind(&like)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(|row| decode_row(row, None)).collect())
    }

    /// Fetch full rows for scored candidates, preserving score order.
    /// Candidates whose chunk disappeared since the index was built are
    /// dropped silently.
    async fn fetch_rows_for_scored(
        &self,
        scored: &[(i64, f32)],
    ) -> Result<Vec<SearchRow>, StorageError> {
        if scored.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; scored.len()].join(",");
        let query = format!(
            "SELECT {} FROM chunks c JOIN files f ON c.file_id = f.id WHERE c.id IN ({})",
            ROW_COLUMNS, placeholders
        );
        let mut q = sqlx::query(&query);
        for (id, _) in scored {
            q = q.bind(id);
        }
        let rows = q.fetch_all(self.pool()).await?;

        let by_id: HashMap<i64, &sqlx::sqlite::SqliteRow> =
            rows.iter().map(|row| (row.get::<i64, _>(0), row)).collect();

        Ok(scored
            .iter()
            .filter_map(|(id, score)| by_id.get(id).map(|row| decode_row(row, Some(*score))))
            .collect())
    }
}
