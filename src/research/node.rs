//! BFS node arena.
//!
//! Nodes form a tree but live in a flat arena with integer ids; parent and
//! child links are indices, so ancestor walks are index chases and no
//! reference cycles exist.

use std::collections::HashMap;

use serde::Serialize;

use crate::store::SearchRow;

use super::budget::NodeBudgets;

/// A chunk retrieved during research, with its reranked relevance and the
/// boundary-expanded line range used for duplicate detection.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchChunk {
    pub chunk_id: i64,
    pub file_path: String,
    pub symbol: Option<String>,
    pub chunk_type: String,
    pub content: String,
    pub start_line: i64,
    pub end_line: i64,
    pub relevance_score: f32,
    pub expanded_range: Option<(i64, i64)>,
}

impl From<SearchRow> for ResearchChunk {
    fn from(row: SearchRow) -> Self {
        Self {
            chunk_id: row.chunk_id,
            file_path: row.file_path,
            symbol: row.symbol,
            chunk_type: row.chunk_type,
            content: row.content,
            start_line: row.start_line,
            end_line: row.end_line,
            relevance_score: row.similarity.unwrap_or(0.0),
            expanded_range: None,
        }
    }
}

/// One node in the BFS research tree.
#[derive(Debug, Clone)]
pub struct BfsNode {
    pub query: String,
    pub depth: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub chunks: Vec<ResearchChunk>,
    /// File path → content loaded for this node (full file or stitched
    /// chunk windows).
    pub file_contents: HashMap<String, String>,
    pub answer: Option<String>,
    pub budgets: NodeBudgets,
    /// Set when the node found zero new chunks; such nodes get no children.
    pub is_terminated_leaf: bool,
    pub new_chunk_count: usize,
    pub duplicate_chunk_count: usize,
}

impl BfsNode {
    pub fn new(query: String, depth: usize, parent: Option<usize>) -> Self {
        Self {
            query,
            depth,
            parent,
            children: Vec::new(),
            chunks: Vec::new(),
            file_contents: HashMap::new(),
            answer: None,
            budgets: NodeBudgets::default(),
            is_terminated_leaf: false,
            new_chunk_count: 0,
            duplicate_chunk_count: 0,
        }
    }
}

/// Flat arena of BFS nodes.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<BfsNode>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: BfsNode) -> usize {
        let id = self.nodes.len();
        if let Some(parent) = node.parent {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.children.push(id);
            }
        }
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: usize) -> &BfsNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: usize) -> &mut BfsNode {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BfsNode> {
        self.nodes.iter()
    }

    /// Strict-ancestor ids of a node, nearest first.
    pub fn ancestors(&self, id: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut current = self.nodes[id].parent;
        while let Some(parent) = current {
            out.push(parent);
            current = self.nodes[parent].parent;
        }
        out
    }
}

/// Accumulated ancestor knowledge used by the termination rule: which
/// files a strict ancestor fully read, and the expanded line ranges of
/// every ancestor chunk, per file.
#[derive(Debug, Clone, Default)]
pub struct AncestorData {
    pub files_fully_read: std::collections::HashSet<String>,
    pub chunk_ranges: HashMap<String, Vec<(i64, i64)>>,
}

/// Research traversal context shared across a BFS level.
#[derive(Debug, Clone)]
pub struct ResearchContext {
    pub root_query: String,
    pub ancestors: Vec<String>,
    pub traversal_path: Vec<String>,
}

impl ResearchContext {
    pub fn new(root_query: impl Into<String>) -> Self {
        Self {
            root_query: root_query.into(),
            ancestors: Vec::new(),
            traversal_path: Vec::new(),
        }
    }
}
