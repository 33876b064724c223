//! Aggregation and single-pass synthesis.
//!
//! After BFS completes, all unique chunks and file contents from the tree
//! are gathered, files are prioritized by summed chunk relevance, and the
//! final prompt is assembled greedily under the global token budget.

use std::collections::HashMap;

use serde::Serialize;

use crate::llm::estimate_tokens;

use super::budget::{
    SINGLE_PASS_MAX_TOKENS, SINGLE_PASS_OUTPUT_TOKENS, SINGLE_PASS_OVERHEAD_TOKENS,
};
use super::node::{NodeArena, ResearchChunk};

/// Top chunks included as snippets when a full file cannot fit.
const SNIPPET_CHUNKS_PER_FILE: usize = 5;

/// Minimum leftover budget worth spending on a partial file.
const MIN_SNIPPET_TOKENS: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct AggregationStats {
    pub total_nodes: usize,
    pub unique_chunks: usize,
    pub unique_files: usize,
    pub total_chunks_found: usize,
    pub total_files_found: usize,
}

/// Tree-wide unique findings.
pub struct Aggregated {
    pub chunks: Vec<ResearchChunk>,
    pub files: HashMap<String, String>,
    pub stats: AggregationStats,
}

/// Collect unique chunks (by chunk id) and file contents (by path) from
/// the whole tree.
pub fn aggregate_all_findings(arena: &NodeArena) -> Aggregated {
    let mut chunks_map: HashMap<i64, ResearchChunk> = HashMap::new();
    let mut files_map: HashMap<String, String> = HashMap::new();
    let mut total_chunks_found = 0usize;
    let mut total_files_found = 0usize;

    for node in arena.iter() {
        total_chunks_found += node.chunks.len();
        total_files_found += node.file_contents.len();
        for chunk in &node.chunks {
            chunks_map.entry(chunk.chunk_id).or_insert_with(|| chunk.clone());
        }
        for (path, content) in &node.file_contents {
            files_map
                .entry(path.clone())
                .or_insert_with(|| content.clone());
        }
    }

    let stats = AggregationStats {
        total_nodes: arena.len(),
        unique_chunks: chunks_map.len(),
        unique_files: files_map.len(),
        total_chunks_found,
        total_files_found,
    };
    tracing::info!(
        nodes = stats.total_nodes,
        unique_chunks = stats.unique_chunks,
        unique_files = stats.unique_files,
        "Aggregated findings from BFS tree"
    );

    Aggregated {
        chunks: chunks_map.into_values().collect(),
        files: files_map,
        stats,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetInfo {
    pub available_tokens: usize,
    pub used_tokens: usize,
    pub files_included_fully: usize,
    pub files_included_partial: usize,
    pub files_excluded: usize,
    pub total_files: usize,
}

/// Fit the aggregated material into the single-pass input budget.
///
/// Chunks sort by relevance; files rank by summed chunk relevance and are
/// included whole while they fit, then as top-chunk snippets, then not at
/// all. Returns `(sorted_chunks, ordered_budgeted_files, info)`.
pub fn manage_token_budget(
    mut chunks: Vec<ResearchChunk>,
    files: &HashMap<String, String>,
) -> (Vec<ResearchChunk>, Vec<(String, String)>, BudgetInfo) {
    let available_tokens =
        SINGLE_PASS_MAX_TOKENS - SINGLE_PASS_OUTPUT_TOKENS - SINGLE_PASS_OVERHEAD_TOKENS;

    chunks.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    // File priority = sum of its chunks' relevance scores.
    let mut file_priority: HashMap<&str, f32> = HashMap::new();
    let mut file_chunks: HashMap<&str, Vec<&ResearchChunk>> = HashMap::new();
    for chunk in &chunks {
        if chunk.file_path.is_empty() {
            continue;
        }
        *file_priority.entry(chunk.file_path.as_str()).or_insert(0.0) += chunk.relevance_score;
        file_chunks
            .entry(chunk.file_path.as_str())
            .or_default()
            .push(chunk);
    }
    let mut ranked_files: Vec<(&str, f32)> = file_priority.into_iter().collect();
    ranked_files.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });

    let mut budgeted: Vec<(String, String)> = Vec::new();
    let mut used_tokens = 0usize;
    let mut fully = 0usize;
    let mut partial = 0usize;
    let mut excluded = 0usize;

    for (path, _) in &ranked_files {
        let Some(content) = files.get(*path) else {
            continue;
        };
        let content_tokens = estimate_tokens(content);

        if used_tokens + content_tokens <= available_tokens {
            budgeted.push((path.to_string(), content.clone()));
            used_tokens += content_tokens;
            fully += 1;
            continue;
        }

        let remaining = available_tokens - used_tokens;
        if remaining <= MIN_SNIPPET_TOKENS {
            excluded += 1;
            break;
        }

        // Partial inclusion: top chunks as snippets.
        let snippet_parts: Vec<String> = file_chunks
            .get(*path)
            .map(|cs| {
                cs.iter()
                    .take(SNIPPET_CHUNKS_PER_FILE)
                    .map(|c| {
                        format!(
                            "# Lines {}-{}\n{}",
                            c.start_line, c.end_line, c.content
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut snippet = snippet_parts.join("\n\n");
        let snippet_tokens = estimate_tokens(&snippet);

        if snippet_tokens <= remaining {
            used_tokens += snippet_tokens;
            budgeted.push((path.to_string(), snippet));
            partial += 1;
        } else {
            super::truncate_at_char_boundary(&mut snippet, remaining * 3);
            used_tokens = available_tokens;
            budgeted.push((path.to_string(), snippet));
            partial += 1;
            break;
        }
    }

    let info = BudgetInfo {
        available_tokens,
        used_tokens,
        files_included_fully: fully,
        files_included_partial: partial,
        files_excluded: excluded,
        total_files: ranked_files.len(),
    };
    tracing::info!(
        used = info.used_tokens,
        available = info.available_tokens,
        full = fully,
        partial,
        excluded,
        "Token budget managed for synthesis"
    );

    (chunks, budgeted, info)
}

/// System prompt for the single-pass synthesis call.
pub fn synthesis_system_prompt() -> String {
    format!(
        r#"You are an expert code researcher. You have the COMPLETE set of code discovered during exploration; synthesize it into a comprehensive answer to the research question.

**Target Output:** {} tokens of factual analysis.

**Output Format:**
## Overview
## Structure & Organization
## Component Analysis
## Data & Control Flow
## Patterns & Conventions
## Integration Points
## Key Findings

**Quality Principles:**
- Always cite specific files and line numbers (file.ext:123 format)
- Extract exact values from code (never "several", "many", "various")
- Document HOW things work, not just that they exist
- Work only with provided code - no speculation beyond what the code shows
- Every technical claim must have a citation"#,
        SINGLE_PASS_OUTPUT_TOKENS
    )
}

/// User prompt: the question plus every budgeted file section.
pub fn build_synthesis_prompt(
    root_query: &str,
    chunks: &[ResearchChunk],
    files: &[(String, String)],
) -> String {
    // Line-range annotation per file from its chunks.
    let mut ranges: HashMap<&str, (i64, i64)> = HashMap::new();
    for chunk in chunks {
        let entry = ranges
            .entry(chunk.file_path.as_str())
            .or_insert((chunk.start_line, chunk.end_line));
        entry.0 = entry.0.min(chunk.start_line);
        entry.1 = entry.1.max(chunk.end_line);
    }

    let mut sections = Vec::with_capacity(files.len());
    for (path, content) in files {
        let range = ranges
            .get(path.as_str())
            .map(|(s, e)| format!(":{}-{}", s, e))
            .unwrap_or_default();
        sections.push(format!(
            "### {}{}\n{}\n{}\n{}",
            path,
            range,
            "=".repeat(80),
            content,
            "=".repeat(80)
        ));
    }

    format!(
        "Question: {}\n\nComplete Code Context:\n{}\n\nProvide a comprehensive analysis that answers the question using ALL the code provided.",
        root_query,
        sections.join("\n\n")
    )
}
