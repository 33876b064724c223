//! Research constants and adaptive token budgets.
//!
//! Budgets interpolate linearly with the depth ratio `depth / max_depth`:
//! leaves analyze raw implementations and get the large end of every input
//! range, the root synthesizes and gets the small end.

/// Minimum rerank score for a symbol or chunk to stay in play.
pub const RELEVANCE_THRESHOLD: f32 = 0.5;

/// Follow-up questions per node and per BFS level.
pub const MAX_FOLLOWUP_QUESTIONS: usize = 3;

/// Symbols taken into the regex cross-search after reranking.
pub const MAX_SYMBOLS_TO_SEARCH: usize = 5;

/// Diverse query formulations generated by LLM query expansion.
pub const NUM_EXPANDED_QUERIES: usize = 3;

/// Semantic page size used inside research (wider than interactive search).
pub const RESEARCH_PAGE_SIZE: usize = 30;

/// Regex page size per symbol search.
pub const SYMBOL_SEARCH_PAGE_SIZE: usize = 10;

// File-content input budget (what the LLM sees as raw code).
pub const FILE_CONTENT_TOKENS_MIN: usize = 10_000;
pub const FILE_CONTENT_TOKENS_MAX: usize = 50_000;

// Total LLM input budget (query + context + code).
pub const LLM_INPUT_TOKENS_MIN: usize = 15_000;
pub const LLM_INPUT_TOKENS_MAX: usize = 60_000;

// Output budgets.
pub const LEAF_ANSWER_TOKENS_BASE: usize = 18_000;
pub const LEAF_ANSWER_TOKENS_BONUS: usize = 3_000;
pub const INTERNAL_ROOT_TARGET: usize = 11_000;
pub const INTERNAL_MAX_TOKENS: usize = 19_000;

/// Per-file token allowance when deciding full-file vs chunk windows.
pub const TOKEN_BUDGET_PER_FILE: usize = 4_000;

// Single-pass synthesis: input + output + overhead must fit MAX.
pub const SINGLE_PASS_MAX_TOKENS: usize = 150_000;
pub const SINGLE_PASS_OUTPUT_TOKENS: usize = 30_000;
pub const SINGLE_PASS_OVERHEAD_TOKENS: usize = 5_000;
pub const SINGLE_PASS_TIMEOUT_SECS: u64 = 600;

/// Cap on smart boundary expansion.
pub const MAX_BOUNDARY_EXPANSION_LINES: usize = 300;

/// Estimated lines of code per indexed chunk.
const LOC_PER_CHUNK: u64 = 20;

/// Token budgets attached to one BFS node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeBudgets {
    pub file_content_tokens: usize,
    pub llm_input_tokens: usize,
    pub answer_tokens: usize,
}

/// BFS depth limit from repository size. LOC is estimated as chunks × 20.
pub fn max_depth_for_chunks(total_chunks: u64) -> usize {
    let estimated_loc = total_chunks * LOC_PER_CHUNK;
    if estimated_loc < 100_000 {
        3
    } else if estimated_loc < 1_000_000 {
        4
    } else if estimated_loc < 10_000_000 {
        5
    } else {
        let magnitude = (estimated_loc as f64).log10();
        3 + (magnitude - 5.0).ceil() as usize
    }
}

/// Depth-adaptive budgets for a node.
pub fn adaptive_budgets(depth: usize, max_depth: usize, is_leaf: bool) -> NodeBudgets {
    let depth_ratio = depth as f64 / max_depth.max(1) as f64;
    let lerp = |min: usize, max: usize| -> usize {
        (min as f64 + (max as f64 - min as f64) * depth_ratio) as usize
    };

    let answer_tokens = if is_leaf {
        lerp(
            LEAF_ANSWER_TOKENS_BASE,
            LEAF_ANSWER_TOKENS_BASE + LEAF_ANSWER_TOKENS_BONUS,
        )
    } else {
        lerp(INTERNAL_ROOT_TARGET, INTERNAL_MAX_TOKENS)
    };

    NodeBudgets {
        file_content_tokens: lerp(FILE_CONTENT_TOKENS_MIN, FILE_CONTENT_TOKENS_MAX),
        llm_input_tokens: lerp(LLM_INPUT_TOKENS_MIN, LLM_INPUT_TOKENS_MAX),
        answer_tokens,
    }
}
