//! Deep research engine.
//!
//! Answers architectural questions by BFS over a query graph: each node
//! runs multi-query semantic search plus symbol-driven regex cross-search,
//! reads the surrounding files under a depth-adaptive token budget, and
//! asks the LLM for follow-up questions. Nodes that surface nothing new
//! terminate; after the traversal a single synthesis call produces the
//! answer under a global token budget.

mod boundaries;
mod budget;
mod node;
mod quality;
mod synthesis;

pub use boundaries::expand_to_natural_boundaries;
pub use budget::{adaptive_budgets, max_depth_for_chunks, NodeBudgets};
pub use node::{AncestorData, BfsNode, NodeArena, ResearchChunk, ResearchContext};
pub use synthesis::{AggregationStats, BudgetInfo};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::llm::{estimate_tokens, CompletionProvider};
use crate::parser::Language;
use crate::search::SearchService;
use crate::Error;

use budget::{
    MAX_FOLLOWUP_QUESTIONS, MAX_SYMBOLS_TO_SEARCH, NUM_EXPANDED_QUERIES, RELEVANCE_THRESHOLD,
    RESEARCH_PAGE_SIZE, SINGLE_PASS_OUTPUT_TOKENS, SINGLE_PASS_TIMEOUT_SECS,
    SYMBOL_SEARCH_PAGE_SIZE, TOKEN_BUDGET_PER_FILE,
};

/// Separator between stitched chunk windows in a partially-read file.
const PARTIAL_READ_SEPARATOR: &str = "\n\n...\n\n";

/// Identifiers dropped during symbol extraction.
const SYMBOL_STOPWORDS: &[&str] = &["self", "cls", "this"];

/// Metadata returned alongside the synthesized answer.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchMetadata {
    pub depth_reached: usize,
    pub nodes_explored: usize,
    pub chunks_analyzed: usize,
    pub aggregation_stats: AggregationStats,
    pub token_budget: BudgetInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResearchReport {
    pub answer: String,
    pub metadata: ResearchMetadata,
}

/// Outcome of processing one BFS node, applied to the arena afterwards.
struct NodeOutcome {
    budgets: NodeBudgets,
    chunks: Vec<ResearchChunk>,
    file_contents: HashMap<String, String>,
    new_count: usize,
    duplicate_count: usize,
    terminated: bool,
    follow_ups: Vec<String>,
}

pub struct DeepResearchEngine {
    search: Arc<SearchService>,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn CompletionProvider>,
    base_dir: PathBuf,
}

impl DeepResearchEngine {
    pub fn new(
        search: Arc<SearchService>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn CompletionProvider>,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            search,
            embedder,
            llm,
            base_dir,
        }
    }

    /// Run the full research procedure for one query.
    pub async fn deep_research(&self, query: &str) -> Result<ResearchReport, Error> {
        tracing::info!(query = %query, "Starting deep research");

        let stats = self.search.store().get_stats().await?;
        let max_depth = max_depth_for_chunks(stats.chunks);
        tracing::info!(max_depth, chunks = stats.chunks, "Computed BFS depth");

        let mut arena = NodeArena::new();
        let root_id = arena.push(BfsNode::new(query.to_string(), 0, None));
        let mut context = ResearchContext::new(query);
        let mut current_level = vec![root_id];

        for depth in 1..=max_depth {
            if current_level.is_empty() {
                break;
            }
            tracing::info!(depth, nodes = current_level.len(), "Processing BFS level");

            // Snapshot ancestor knowledge and context before the level runs
            // concurrently; sibling nodes must not observe each other.
            let jobs: Vec<(usize, String, AncestorData, ResearchContext)> = current_level
                .iter()
                .map(|&id| {
                    (
                        id,
                        arena.get(id).query.clone(),
                        collect_ancestor_data(&arena, id),
                        context.clone(),
                    )
                })
                .collect();

            let outcomes = join_all(jobs.into_iter().map(|(id, node_query, ancestors, ctx)| {
                async move {
                    let outcome = self
                        .process_node(&node_query, depth, max_depth, ancestors, &ctx)
                        .await;
                    (id, node_query, outcome)
                }
            }))
            .await;

            let mut follow_ups: Vec<(usize, String)> = Vec::new();
            for (id, node_query, outcome) in outcomes {
                match outcome {
                    Ok(out) => {
                        if out.terminated {
                            tracing::info!(
                                query = %node_query,
                                duplicates = out.duplicate_count,
                                "Node terminated: no new chunks"
                            );
                        }
                        let node = arena.get_mut(id);
                        node.budgets = out.budgets;
                        node.chunks = out.chunks;
                        node.file_contents = out.file_contents;
                        node.new_chunk_count = out.new_count;
                        node.duplicate_chunk_count = out.duplicate_count;
                        node.is_terminated_leaf = out.terminated;
                        if !out.terminated {
                            follow_ups.extend(
                                out.follow_ups
                                    .into_iter()
                                    .take(MAX_FOLLOWUP_QUESTIONS)
                                    .map(|q| (id, q)),
                            );
                        }
                    }
                    Err(e) => {
                        // A failed node becomes a childless leaf.
                        tracing::error!(query = %node_query, error = %e, "BFS node failed");
                    }
                }
            }

            for id in &current_level {
                let q = arena.get(*id).query.clone();
                if !context.ancestors.contains(&q) {
                    context.ancestors.push(q);
                }
            }

            // Cap level fan-out: more than 3 follow-ups are synthesized
            // into 3 fresh questions exploring unexplored aspects.
            let child_depth = depth + 1;
            let mut next_level = Vec::new();
            if follow_ups.len() > MAX_FOLLOWUP_QUESTIONS {
                let queries: Vec<String> =
                    follow_ups.iter().map(|(_, q)| q.clone()).collect();
                let synthesized = self
                    .synthesize_questions(&queries, &context, MAX_FOLLOWUP_QUESTIONS)
                    .await;
                let merge_id = arena.push(BfsNode::new(
                    format!("[Merge of {} research directions]", queries.len()),
                    child_depth.saturating_sub(1),
                    None,
                ));
                for q in synthesized {
                    next_level.push(arena.push(BfsNode::new(q, child_depth, Some(merge_id))));
                }
            } else {
                for (parent, q) in follow_ups {
                    next_level.push(arena.push(BfsNode::new(q, child_depth, Some(parent))));
                }
            }
            current_level = next_level;
        }

        tracing::info!("BFS traversal complete, aggregating findings");
        let aggregated = synthesis::aggregate_all_findings(&arena);
        let (prioritized_chunks, budgeted_files, budget_info) =
            synthesis::manage_token_budget(aggregated.chunks, &aggregated.files);

        let answer = self
            .single_pass_synthesis(query, &prioritized_chunks, &budgeted_files)
            .await?;

        let answer = quality::filter_verbosity(&answer);
        let warnings = quality::validate_output_quality(&answer, SINGLE_PASS_OUTPUT_TOKENS);
        for warning in &warnings {
            tracing::warn!(warning = %warning, "Answer quality issue");
        }
        let answer = quality::ensure_citations(answer, &prioritized_chunks);

        let metadata = ResearchMetadata {
            depth_reached: arena.iter().map(|n| n.depth).max().unwrap_or(0),
            nodes_explored: arena.len(),
            chunks_analyzed: arena.iter().map(|n| n.chunks.len()).sum(),
            aggregation_stats: aggregated.stats,
            token_budget: budget_info,
        };
        tracing::info!(
            depth_reached = metadata.depth_reached,
            nodes = metadata.nodes_explored,
            chunks = metadata.chunks_analyzed,
            "Deep research completed"
        );

        Ok(ResearchReport { answer, metadata })
    }

    async fn process_node(
        &self,
        node_query: &str,
        depth: usize,
        max_depth: usize,
        ancestors: AncestorData,
        context: &ResearchContext,
    ) -> Result<NodeOutcome, Error> {
        let budgets = adaptive_budgets(depth, max_depth, true);
        let search_query = build_search_query(node_query, context);

        let mut chunks = self.unified_search(&search_query, node_query, context).await?;
        if chunks.is_empty() {
            tracing::warn!(query = %node_query, "No chunks found for node");
            return Ok(NodeOutcome {
                budgets,
                chunks,
                file_contents: HashMap::new(),
                new_count: 0,
                duplicate_count: 0,
                terminated: false,
                follow_ups: Vec::new(),
            });
        }

        let file_contents = self
            .read_files_with_budget(&mut chunks, budgets.file_content_tokens)
            .await;

        let is_root = context.ancestors.is_empty();
        let (new_count, duplicate_count) =
            detect_new_information(&chunks, &ancestors, is_root);

        if new_count == 0 {
            return Ok(NodeOutcome {
                budgets,
                chunks,
                file_contents,
                new_count,
                duplicate_count,
                terminated: true,
                follow_ups: Vec::new(),
            });
        }

        let follow_ups = self
            .generate_follow_up_questions(
                node_query,
                context,
                &file_contents,
                &chunks,
                budgets.llm_input_tokens,
            )
            .await;

        Ok(NodeOutcome {
            budgets,
            chunks,
            file_contents,
            new_count,
            duplicate_count,
            terminated: false,
            follow_ups,
        })
    }

    /// Steps 2–7: query expansion, parallel multi-hop semantic searches,
    /// symbol extraction + rerank, symbol regex fan-out, union, final
    /// rerank.
    async fn unified_search(
        &self,
        search_query: &str,
        node_query: &str,
        context: &ResearchContext,
    ) -> Result<Vec<ResearchChunk>, Error> {
        let variants = self.expand_query(search_query, context).await;

        let vectors = self.embedder.embed(&variants).await.map_err(Error::from)?;
        let provider = self.embedder.name().to_string();
        let model = self.embedder.model().to_string();

        let searches = vectors.iter().map(|vector| {
            let provider = provider.clone();
            let model = model.clone();
            async move {
                self.search
                    .search_semantic_vector(
                        vector,
                        &provider,
                        &model,
                        RESEARCH_PAGE_SIZE,
                        0,
                        Some(RELEVANCE_THRESHOLD),
                        None,
                        true,
                    )
                    .await
            }
        });

        let mut unified: HashMap<i64, ResearchChunk> = HashMap::new();
        for result in join_all(searches).await {
            match result {
                Ok((rows, _)) => {
                    for row in rows {
                        unified.entry(row.chunk_id).or_insert_with(|| row.into());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Semantic search variant failed"),
            }
        }

        // Symbol cross-search: extract identifiers from the semantic hits,
        // keep the most relevant, and grep for exact occurrences.
        let symbols = {
            let semantic_chunks: Vec<&ResearchChunk> = unified.values().collect();
            extract_symbols(&semantic_chunks)
        };
        let top_symbols = self
            .rerank_symbols(symbols, node_query, context)
            .await;

        if !top_symbols.is_empty() {
            let regex_searches = top_symbols.iter().map(|symbol| {
                let pattern = format!(r"\b{}\b", regex::escape(symbol));
                async move {
                    self.search
                        .search_regex(&pattern, SYMBOL_SEARCH_PAGE_SIZE, 0, None)
                        .await
                }
            });
            for result in join_all(regex_searches).await {
                match result {
                    Ok((rows, _)) => {
                        for row in rows {
                            unified.entry(row.chunk_id).or_insert_with(|| row.into());
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Symbol regex search failed"),
                }
            }
        }

        let mut chunks: Vec<ResearchChunk> = unified.into_values().collect();
        if chunks.len() > 1 {
            chunks = self.rerank_chunks(chunks, node_query, context).await;
        }
        Ok(chunks)
    }

    /// Expand a query into diverse formulations via the LLM. Variant 1 is
    /// the original verbatim; failures fall back to the original alone.
    async fn expand_query(&self, query: &str, context: &ResearchContext) -> Vec<String> {
        let system = "You are optimizing queries for CODE SEARCH in a semantic embedding system.\n\
                      Your goal: reformulate the query to match how code is actually written and documented.\n\
                      Stay within the CODE DOMAIN - no abstract concepts or unrelated technologies.";

        let ancestor_path = last_ancestors(&context.ancestors, 2).join(" -> ");
        let prompt = format!(
            "Original question: {query}\n\
             Codebase context: {root}\nPrior exploration: {ancestor_path}\n\n\
             Generate {n} code search queries for semantic embedding:\n\n\
             Query 1: Output the original question EXACTLY as given (verbatim)\n\
             Query 2: Rephrase with code-specific technical terms (likely function/class names, programming terminology)\n\
             Query 3: Describe hypothetical code structure (patterns like \"class X\", \"def method()\", \"calls Y\")\n\n\
             RULES:\n\
             - All queries must be about CODE in THIS codebase\n\
             - Use technical terms that would appear in actual code/comments/docstrings\n\
             - Keep each query 1-2 sentences maximum\n\n\
             OUTPUT FORMAT (simple numbered list):\n1. [query]\n2. [query]\n3. [query]",
            query = query,
            root = context.root_query,
            ancestor_path = ancestor_path,
            n = NUM_EXPANDED_QUERIES,
        );

        match self.llm.complete(&prompt, system, 2500).await {
            Ok(response) => {
                let mut queries = parse_numbered_list(&response);
                if queries.is_empty() {
                    tracing::warn!("Query expansion returned nothing, using original");
                    return vec![query.to_string()];
                }
                // The first variant must be the query verbatim.
                queries[0] = query.to_string();
                while queries.len() < NUM_EXPANDED_QUERIES {
                    queries.push(query.to_string());
                }
                queries.truncate(NUM_EXPANDED_QUERIES);
                queries
            }
            Err(e) => {
                tracing::warn!(error = %e, "Query expansion failed, using original");
                vec![query.to_string()]
            }
        }
    }

    /// Keep the symbols most relevant to the query path. Uses the
    /// embedder's reranker when available; otherwise the first N.
    async fn rerank_symbols(
        &self,
        symbols: Vec<String>,
        node_query: &str,
        context: &ResearchContext,
    ) -> Vec<String> {
        if symbols.len() <= MAX_SYMBOLS_TO_SEARCH {
            return symbols;
        }
        if !self.embedder.supports_reranking() {
            tracing::debug!("No reranker available, taking first symbols");
            return symbols.into_iter().take(MAX_SYMBOLS_TO_SEARCH).collect();
        }

        let rerank_query = rerank_context(context, node_query);
        match self
            .embedder
            .rerank(&rerank_query, &symbols, symbols.len().min(10))
            .await
        {
            Ok(results) => {
                let mut top: Vec<String> = results
                    .iter()
                    .filter(|r| r.score >= RELEVANCE_THRESHOLD)
                    .filter_map(|r| symbols.get(r.index).cloned())
                    .take(MAX_SYMBOLS_TO_SEARCH)
                    .collect();
                if top.is_empty() {
                    // Filtering emptied the list: take the top N by score
                    // regardless.
                    top = results
                        .iter()
                        .filter_map(|r| symbols.get(r.index).cloned())
                        .take(MAX_SYMBOLS_TO_SEARCH)
                        .collect();
                }
                top
            }
            Err(e) => {
                tracing::warn!(error = %e, "Symbol rerank failed, taking first symbols");
                symbols.into_iter().take(MAX_SYMBOLS_TO_SEARCH).collect()
            }
        }
    }

    /// Final rerank of unified chunks by content relevance.
    async fn rerank_chunks(
        &self,
        mut chunks: Vec<ResearchChunk>,
        node_query: &str,
        context: &ResearchContext,
    ) -> Vec<ResearchChunk> {
        if self.embedder.supports_reranking() {
            let documents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let rerank_query = rerank_context(context, node_query);
            match self
                .embedder
                .rerank(&rerank_query, &documents, documents.len())
                .await
            {
                Ok(results) => {
                    for r in results {
                        if let Some(chunk) = chunks.get_mut(r.index) {
                            chunk.relevance_score = r.score;
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Chunk rerank failed, keeping scores"),
            }
        }
        chunks.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        chunks
    }

    /// Step 8: read the files behind the chunks within the node's token
    /// budget. Whole file when it fits its per-file allowance, otherwise
    /// boundary-expanded chunk windows. Expanded ranges are recorded on
    /// the chunks for the termination rule.
    async fn read_files_with_budget(
        &self,
        chunks: &mut [ResearchChunk],
        max_tokens: usize,
    ) -> HashMap<String, String> {
        // Group chunk indices by file, preserving chunk (relevance) order.
        let mut file_order: Vec<String> = Vec::new();
        let mut by_file_map: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.file_path.is_empty() {
                continue;
            }
            if !by_file_map.contains_key(&chunk.file_path) {
                file_order.push(chunk.file_path.clone());
            }
            by_file_map
                .entry(chunk.file_path.clone())
                .or_default()
                .push(i);
        }
        let by_file: Vec<(String, Vec<usize>)> = file_order
            .into_iter()
            .map(|path| {
                let indices = by_file_map.remove(&path).unwrap_or_default();
                (path, indices)
            })
            .collect();

        let mut file_contents = HashMap::new();
        let mut total_tokens = 0usize;

        for (file_path, indices) in by_file {
            if total_tokens >= max_tokens {
                tracing::debug!(limit = max_tokens, "File budget exhausted");
                break;
            }
            let resolved = self.resolve_path(&file_path);
            let content = match tokio::fs::read_to_string(&resolved).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(path = %resolved.display(), error = %e, "Failed to read file");
                    continue;
                }
            };
            let lines: Vec<&str> = content.lines().collect();
            let language = Language::from_path(Path::new(&file_path));

            // Record expanded ranges for every chunk of this file.
            for &i in &indices {
                let chunk = &chunks[i];
                let complete = chunk
                    .chunk_type
                    .parse::<crate::parser::ChunkType>()
                    .map(|t| t.is_complete_unit())
                    .unwrap_or(false);
                let (start, end) = expand_to_natural_boundaries(
                    &lines,
                    chunk.start_line.max(1) as usize,
                    chunk.end_line.max(1) as usize,
                    complete,
                    language,
                );
                chunks[i].expanded_range = Some((start as i64, end as i64));
            }

            let per_file_budget = TOKEN_BUDGET_PER_FILE * indices.len();
            let content_tokens = estimate_tokens(&content);

            if content_tokens <= per_file_budget {
                if total_tokens + content_tokens <= max_tokens {
                    file_contents.insert(file_path, content);
                    total_tokens += content_tokens;
                } else {
                    let remaining = max_tokens - total_tokens;
                    if remaining > 500 {
                        let mut truncated = content;
                        truncate_at_char_boundary(&mut truncated, remaining * 3);
                        file_contents.insert(file_path, truncated);
                    }
                    break;
                }
            } else {
                // Too large for a full read: stitch expanded windows.
                let mut windows = Vec::new();
                for &i in &indices {
                    let (start, end) = chunks[i]
                        .expanded_range
                        .unwrap_or((chunks[i].start_line, chunks[i].end_line));
                    let start_idx = (start.max(1) as usize - 1).min(lines.len());
                    let end_idx = (end.max(1) as usize).min(lines.len());
                    windows.push(lines[start_idx..end_idx].join("\n"));
                }
                let combined = windows.join(PARTIAL_READ_SEPARATOR);
                let combined_tokens = estimate_tokens(&combined);
                if total_tokens + combined_tokens <= max_tokens {
                    total_tokens += combined_tokens;
                    file_contents.insert(file_path, combined);
                } else {
                    let remaining = max_tokens - total_tokens;
                    if remaining > 500 {
                        let mut truncated = combined;
                        truncate_at_char_boundary(&mut truncated, remaining * 3);
                        file_contents.insert(file_path, truncated);
                    }
                    break;
                }
            }
        }

        tracing::debug!(
            files = file_contents.len(),
            tokens = total_tokens,
            limit = max_tokens,
            "File reading complete"
        );
        file_contents
    }

    fn resolve_path(&self, file_path: &str) -> PathBuf {
        let path = Path::new(file_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Step 9: ask the LLM for follow-up questions grounded in the loaded
    /// code, then filter for architectural relevance.
    async fn generate_follow_up_questions(
        &self,
        node_query: &str,
        context: &ResearchContext,
        file_contents: &HashMap<String, String>,
        chunks: &[ResearchChunk],
        max_input_tokens: usize,
    ) -> Vec<String> {
        if file_contents.is_empty() {
            tracing::warn!(query = %node_query, "No file contents, skipping follow-ups");
            return Vec::new();
        }

        let system = "You are a research assistant helping explore a codebase.\n\
            Generate 1-3 follow-up questions that clarify component interactions, trace data/control flow, or resolve referenced-but-missing dependencies.\n\
            RULES:\n\
            - Questions must be DIRECTLY about code elements found (functions, classes, imports mentioned)\n\
            - Each question must be specific and searchable (include exact symbol/file names when possible)\n\
            - NO generic questions\n\
            - If the code fully answers the question, generate 0-1 follow-ups\n\
            FORMAT: Numbered list, one question per line";

        let mut code_sections = Vec::new();
        let mut used_tokens = 0usize;
        for (path, content) in file_contents {
            let tokens = estimate_tokens(content);
            if used_tokens + tokens <= max_input_tokens {
                code_sections.push(format!("File: {}\n{}\n{}", path, "=".repeat(60), content));
                used_tokens += tokens;
            } else {
                let remaining = max_input_tokens.saturating_sub(used_tokens);
                if remaining > 500 {
                    let mut truncated = content.clone();
                    truncate_at_char_boundary(&mut truncated, remaining * 3);
                    code_sections.push(format!(
                        "File: {}\n{}\n{}...",
                        path,
                        "=".repeat(60),
                        truncated
                    ));
                }
                break;
            }
        }

        let chunks_preview: Vec<String> = chunks
            .iter()
            .take(10)
            .map(|c| {
                format!(
                    "- {}:{}-{} ({})",
                    c.file_path,
                    c.start_line,
                    c.end_line,
                    c.symbol.as_deref().unwrap_or("no symbol")
                )
            })
            .collect();

        let prompt = format!(
            "Root Query: {}\n\nCurrent Question: {}\n\nBFS Context: {}\n\nCode Found:\n{}\n\nChunks Overview:\n{}\n\n\
             Generate focused follow-up questions to deepen architectural understanding of the ROOT query.\n\
             Maximum {} questions. If the code fully answers the question, generate fewer.",
            context.root_query,
            node_query,
            context.ancestors.join(" -> "),
            code_sections.join("\n\n"),
            chunks_preview.join("\n"),
            MAX_FOLLOWUP_QUESTIONS,
        );

        let questions = match self.llm.complete(&prompt, system, 3000).await {
            Ok(response) => parse_numbered_list(&response),
            Err(e) => {
                tracing::warn!(error = %e, "Follow-up generation failed");
                return Vec::new();
            }
        };
        if questions.is_empty() {
            return questions;
        }

        let filtered = self
            .filter_relevant_followups(&questions, node_query, context)
            .await;
        filtered.into_iter().take(MAX_FOLLOWUP_QUESTIONS).collect()
    }

    /// Second LLM pass: keep only architecturally relevant follow-ups.
    async fn filter_relevant_followups(
        &self,
        questions: &[String],
        node_query: &str,
        context: &ResearchContext,
    ) -> Vec<String> {
        if questions.len() <= 1 {
            return questions.to_vec();
        }

        let listed: Vec<String> = questions
            .iter()
            .enumerate()
            .map(|(i, q)| format!("{}. {}", i + 1, q))
            .collect();
        let prompt = format!(
            "Root Query: {}\nCurrent Question: {}\n\nCandidate Follow-ups:\n{}\n\n\
             Select the questions that help understand system architecture, relate to code elements already found, and deepen the ROOT query.\n\
             Return ONLY the question numbers (comma-separated, e.g. \"1,3\").\nMaximum {} questions.",
            context.root_query,
            node_query,
            listed.join("\n"),
            MAX_FOLLOWUP_QUESTIONS,
        );

        match self
            .llm
            .complete(
                &prompt,
                "You are filtering research questions for architectural relevance.",
                1000,
            )
            .await
        {
            Ok(response) => {
                let selected: Vec<String> = response
                    .replace(',', " ")
                    .split_whitespace()
                    .filter_map(|token| token.parse::<usize>().ok())
                    .filter_map(|n| n.checked_sub(1))
                    .filter_map(|i| questions.get(i).cloned())
                    .collect();
                if selected.is_empty() {
                    questions.iter().take(MAX_FOLLOWUP_QUESTIONS).cloned().collect()
                } else {
                    selected
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Follow-up filtering failed, keeping all");
                questions.iter().take(MAX_FOLLOWUP_QUESTIONS).cloned().collect()
            }
        }
    }

    /// Collapse an oversized BFS level into `target` fresh questions that
    /// explore unexplored aspects.
    async fn synthesize_questions(
        &self,
        questions: &[String],
        context: &ResearchContext,
        target: usize,
    ) -> Vec<String> {
        let listed: Vec<String> = questions
            .iter()
            .enumerate()
            .map(|(i, q)| format!("{}. {}", i + 1, q))
            .collect();
        let prompt = format!(
            "Root Query: {}\n\nCurrent research directions being merged:\n{}\n\n\
             Synthesize {} questions that explore NEW, UNEXPLORED aspects, integrate multiple perspectives, and are concrete and searchable.\n\n\
             OUTPUT FORMAT (numbered list):\n1. [question]\n2. [question]\n3. [question]",
            context.root_query,
            listed.join("\n"),
            target,
        );

        match self
            .llm
            .complete(
                &prompt,
                "You are a research assistant synthesizing research directions into new questions that complete the picture.",
                2000,
            )
            .await
        {
            Ok(response) => {
                let synthesized = parse_numbered_list(&response);
                if synthesized.is_empty() {
                    tracing::warn!("Question synthesis returned nothing, taking first N");
                    questions.iter().take(target).cloned().collect()
                } else {
                    tracing::info!(
                        from = questions.len(),
                        to = synthesized.len().min(target),
                        "Synthesized level questions"
                    );
                    synthesized.into_iter().take(target).collect()
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Question synthesis failed, taking first N");
                questions.iter().take(target).cloned().collect()
            }
        }
    }

    /// One synthesis call over everything, bounded by the 10-minute
    /// timeout.
    async fn single_pass_synthesis(
        &self,
        root_query: &str,
        chunks: &[ResearchChunk],
        files: &[(String, String)],
    ) -> Result<String, Error> {
        let system = synthesis::synthesis_system_prompt();
        let prompt = synthesis::build_synthesis_prompt(root_query, chunks, files);

        tracing::info!(
            files = files.len(),
            chunks = chunks.len(),
            max_tokens = SINGLE_PASS_OUTPUT_TOKENS,
            "Calling LLM for single-pass synthesis"
        );

        match tokio::time::timeout(
            Duration::from_secs(SINGLE_PASS_TIMEOUT_SECS),
            self.llm.complete(&prompt, &system, SINGLE_PASS_OUTPUT_TOKENS),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::LlmTimeout(SINGLE_PASS_TIMEOUT_SECS)),
        }
    }
}

/// Build the embedding search query: the node's question first (embedding
/// models weight the head), then at most the last two ancestors as context.
pub fn build_search_query(query: &str, context: &ResearchContext) -> String {
    if context.ancestors.is_empty() {
        return query.to_string();
    }
    let parents = last_ancestors(&context.ancestors, 2);
    format!("{} | Context: {}", query, parents.join(" → "))
}

fn last_ancestors(ancestors: &[String], count: usize) -> Vec<String> {
    ancestors
        .iter()
        .rev()
        .take(count)
        .rev()
        .cloned()
        .collect()
}

/// Rerank context: root query + full ancestor path + node query.
fn rerank_context(context: &ResearchContext, node_query: &str) -> String {
    let path = context.ancestors.join(" -> ");
    format!("{} {} {}", context.root_query, path, node_query)
        .trim()
        .to_string()
}

/// Extract searchable symbols from retrieved chunks: the symbol field plus
/// parameter names pulled from the declaration line. Single characters,
/// digits, and common self-references are dropped.
pub fn extract_symbols(chunks: &[&ResearchChunk]) -> Vec<String> {
    let mut symbols: HashSet<String> = HashSet::new();

    for chunk in chunks {
        if let Some(symbol) = &chunk.symbol {
            let trimmed = symbol.trim();
            if !trimmed.is_empty() {
                symbols.insert(trimmed.to_string());
            }
        }
        // Parameter names from the declaration line of non-generic kinds.
        if chunk.chunk_type != "block"
            && chunk.chunk_type != "comment"
            && chunk.chunk_type != "unknown"
        {
            if let Some(first_line) = chunk.content.lines().next() {
                if let (Some(open), Some(close)) = (first_line.find('('), first_line.rfind(')')) {
                    if open < close {
                        for param in first_line[open + 1..close].split(',') {
                            let name: String = param
                                .trim()
                                .chars()
                                .take_while(|c| c.is_alphanumeric() || *c == '_')
                                .collect();
                            if !name.is_empty() {
                                symbols.insert(name);
                            }
                        }
                    }
                }
            }
        }
    }

    let mut filtered: Vec<String> = symbols
        .into_iter()
        .filter(|s| {
            s.len() > 1
                && !s.chars().all(|c| c.is_ascii_digit())
                && !SYMBOL_STOPWORDS.contains(&s.to_lowercase().as_str())
        })
        .collect();
    filtered.sort();
    filtered
}

/// Parse an LLM's numbered (or dashed) list response.
pub fn parse_numbered_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            let first = trimmed.chars().next()?;
            if !first.is_ascii_digit() && first != '-' {
                return None;
            }
            let item = trimmed
                .trim_start_matches(|c: char| {
                    c.is_ascii_digit() || c == '.' || c == '-' || c == ')' || c == ' '
                })
                .trim();
            (!item.is_empty()).then(|| item.to_string())
        })
        .collect()
}

/// Walk the strict ancestors of a node, collecting fully-read file paths
/// and expanded chunk ranges per file.
pub fn collect_ancestor_data(arena: &NodeArena, node_id: usize) -> AncestorData {
    let mut data = AncestorData::default();
    for ancestor_id in arena.ancestors(node_id) {
        let node = arena.get(ancestor_id);
        for (path, content) in &node.file_contents {
            if is_file_fully_read(content) {
                data.files_fully_read.insert(path.clone());
            }
        }
        for chunk in &node.chunks {
            let range = chunk
                .expanded_range
                .unwrap_or((chunk.start_line, chunk.end_line));
            data.chunk_ranges
                .entry(chunk.file_path.clone())
                .or_default()
                .push(range);
        }
    }
    data
}

/// Partial reads carry the window separator; anything else is a full read.
pub fn is_file_fully_read(content: &str) -> bool {
    !content.contains(PARTIAL_READ_SEPARATOR)
}

/// Truncate a string to at most `max_bytes`, backing off to the nearest
/// char boundary so multi-byte characters never split.
pub(crate) fn truncate_at_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut idx = max_bytes;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    s.truncate(idx);
}

/// A chunk is a 100% duplicate iff its file was fully read by an ancestor,
/// or its expanded range is completely contained in an ancestor range for
/// the same file. Partial overlaps count as new.
pub fn is_chunk_duplicate(chunk: &ResearchChunk, ancestors: &AncestorData) -> bool {
    if chunk.file_path.is_empty() {
        return false;
    }
    if ancestors.files_fully_read.contains(&chunk.file_path) {
        return true;
    }
    let (start, end) = chunk
        .expanded_range
        .unwrap_or((chunk.start_line, chunk.end_line));
    ancestors
        .chunk_ranges
        .get(&chunk.file_path)
        .map(|ranges| {
            ranges
                .iter()
                .any(|(anc_start, anc_end)| start >= *anc_start && end <= *anc_end)
        })
        .unwrap_or(false)
}

/// Count new vs duplicate chunks; the root always counts everything new.
pub fn detect_new_information(
    chunks: &[ResearchChunk],
    ancestors: &AncestorData,
    is_root: bool,
) -> (usize, usize) {
    if is_root {
        return (chunks.len(), 0);
    }
    let mut new_count = 0;
    let mut duplicate_count = 0;
    for chunk in chunks {
        if is_chunk_duplicate(chunk, ancestors) {
            duplicate_count += 1;
        } else {
            new_count += 1;
        }
    }
    (new_count, duplicate_count)
}
