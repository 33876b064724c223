//! Response-size limiting.
//!
//! Search responses are bounded by an estimated token budget: when the
//! serialized payload exceeds it, results are dropped from the tail in
//! ≈25% steps and the pagination block is updated so the client can fetch
//! the dropped rows on the next page.

use serde_json::json;

use crate::llm::estimate_tokens;
use crate::store::{Pagination, SearchRow};

/// Default budget when the caller does not specify one.
pub const MAX_RESPONSE_TOKENS: usize = 20_000;
/// Bounds for the caller-supplied budget.
pub const MIN_RESPONSE_TOKENS: usize = 1_000;
pub const MAX_ALLOWED_TOKENS: usize = 25_000;

/// Clamp a requested budget into the allowed range.
pub fn clamp_response_tokens(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(MAX_RESPONSE_TOKENS)
        .clamp(MIN_RESPONSE_TOKENS, MAX_ALLOWED_TOKENS)
}

/// Shrink `results` until the serialized response fits `max_tokens`.
pub fn limit_response_size(
    results: Vec<SearchRow>,
    pagination: Pagination,
    max_tokens: usize,
) -> (Vec<SearchRow>, Pagination) {
    if results.is_empty() {
        return (results, pagination);
    }

    let original_len = results.len();
    let mut limited = results;

    while !limited.is_empty() {
        let actual = limited.len();
        let dropped = actual < original_len;
        let mut updated = pagination.clone();
        updated.page_size = actual;
        updated.has_more = updated.has_more || dropped;
        if dropped {
            updated.next_offset = Some(updated.offset + actual);
        }

        let payload = json!({"results": limited, "pagination": updated});
        if estimate_tokens(&payload.to_string()) <= max_tokens {
            if dropped {
                tracing::debug!(
                    kept = actual,
                    dropped = original_len - actual,
                    "Response truncated to fit token budget"
                );
            }
            return (limited, updated);
        }

        // Drop a quarter of the remaining rows from the tail.
        let reduction = (limited.len() / 4).max(1);
        limited.truncate(limited.len() - reduction);
    }

    // Even a single row exceeds the budget: empty page, has_more signals
    // the payload cannot shrink further.
    let empty_pagination = Pagination {
        offset: pagination.offset,
        page_size: 0,
        has_more: original_len > 0,
        next_offset: None,
        total: pagination.total,
    };
    (Vec::new(), empty_pagination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(id: i64, content_len: usize) -> SearchRow {
        SearchRow {
            chunk_id: id,
            symbol: Some(format!("sym{}", id)),
            content: "x".repeat(content_len),
            chunk_type: "function".into(),
            start_line: 1,
            end_line: 10,
            file_path: format!("src/file{}.rs", id),
            language: "rust".into(),
            similarity: None,
        }
    }

    #[test]
    fn test_clamp_response_tokens() {
        assert_eq!(clamp_response_tokens(None), MAX_RESPONSE_TOKENS);
        assert_eq!(clamp_response_tokens(Some(500)), MIN_RESPONSE_TOKENS);
        assert_eq!(clamp_response_tokens(Some(30_000)), MAX_ALLOWED_TOKENS);
        assert_eq!(clamp_response_tokens(Some(5_000)), 5_000);
    }

    #[test]
    fn test_small_response_untouched() {
        let rows = vec![row(1, 50), row(2, 50)];
        let pagination = Pagination::new(0, 10, 2);
        let (limited, updated) = limit_response_size(rows, pagination, MAX_RESPONSE_TOKENS);
        assert_eq!(limited.len(), 2);
        // page_size always reflects the actual returned count.
        assert_eq!(updated.page_size, 2);
        assert!(!updated.has_more);
        assert_eq!(updated.next_offset, None);
        assert_eq!(updated.total, 2);
    }

    #[test]
    fn test_oversized_response_truncates_tail() {
        let rows: Vec<SearchRow> = (0..20).map(|i| row(i, 2000)).collect();
        let pagination = Pagination::new(0, 20, 40);
        let (limited, updated) = limit_response_size(rows, pagination, MIN_RESPONSE_TOKENS);
        assert!(limited.len() < 20);
        assert!(updated.has_more);
        assert_eq!(updated.page_size, limited.len());
        assert_eq!(updated.next_offset, Some(limited.len()));
        // Kept rows are the head of the original order.
        for (i, r) in limited.iter().enumerate() {
            assert_eq!(r.chunk_id, i as i64);
        }
    }

    #[test]
    fn test_single_huge_row_yields_empty_page() {
        let rows = vec![row(1, 200_000)];
        let pagination = Pagination::new(0, 1, 1);
        let (limited, updated) = limit_response_size(rows, pagination, MIN_RESPONSE_TOKENS);
        assert!(limited.is_empty());
        assert_eq!(updated.page_size, 0);
        assert!(updated.has_more, "has_more signals the payload cannot shrink");
        assert_eq!(updated.next_offset, None);
    }

    proptest! {
        /// The limiter always lands under budget or returns an empty page.
        #[test]
        fn prop_limited_response_fits_budget(
            sizes in prop::collection::vec(10usize..3000, 1..30),
            budget in MIN_RESPONSE_TOKENS..MAX_ALLOWED_TOKENS
        ) {
            let rows: Vec<SearchRow> = sizes
                .iter()
                .enumerate()
                .map(|(i, len)| row(i as i64, *len))
                .collect();
            let count = rows.len();
            let pagination = Pagination::new(0, count, count);
            let (limited, updated) = limit_response_size(rows, pagination, budget);
            if !limited.is_empty() {
                let payload = json!({"results": limited, "pagination": updated});
                prop_assert!(estimate_tokens(&payload.to_string()) <= budget);
            }
        }
    }
}
