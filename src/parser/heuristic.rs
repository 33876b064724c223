//! Heuristic chunk splitter.
//!
//! Splits source text into chunks without a grammar: indentation walking for
//! Python-like files, brace balancing for C-family files, paragraph blocks
//! for everything else. Grammar-backed parsers (tree-sitter and friends)
//! plug in behind the same [`CodeParser`](super::CodeParser) trait from
//! outside the crate; this splitter keeps small deployments and the test
//! suite self-contained.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::{ChunkType, Language, ParsedChunk};
use super::{CodeParser, ParseError};

/// Upper bound on the size of a fallback paragraph chunk.
const MAX_BLOCK_LINES: usize = 200;

static PY_DEF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)").expect("static regex"));
static PY_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^class\s+([A-Za-z_][A-Za-z0-9_]*)").expect("static regex"));
static BRACE_DECL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(fn|func|function|class|struct|enum|trait|interface|impl)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("static regex")
});
static CALLABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("static regex"));

/// Line-oriented view of a source file with byte offsets.
struct LineMap<'a> {
    text: &'a str,
    /// Byte offset of the start of each line, plus one trailing entry at
    /// `text.len()`.
    starts: Vec<usize>,
}

impl<'a> LineMap<'a> {
    fn new(text: &'a str) -> Self {
        let mut starts = vec![0];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        if *starts.last().expect("non-empty starts") != text.len() {
            starts.push(text.len());
        }
        Self { text, starts }
    }

    /// Number of content lines (a trailing newline does not add a line).
    fn len(&self) -> usize {
        self.starts.len() - 1
    }

    fn line(&self, idx: usize) -> &'a str {
        self.text[self.starts[idx]..self.starts[idx + 1]].trim_end_matches(['\n', '\r'])
    }

    /// Chunk for the inclusive 0-indexed line range `[start, end]`.
    fn chunk(
        &self,
        start: usize,
        end: usize,
        chunk_type: ChunkType,
        symbol: Option<String>,
        signature: Option<String>,
        language: Language,
    ) -> ParsedChunk {
        let start_byte = self.starts[start];
        let end_byte = self.starts[end + 1];
        ParsedChunk {
            chunk_type,
            symbol,
            code: self.text[start_byte..end_byte].to_string(),
            start_line: (start + 1) as u32,
            end_line: (end + 1) as u32,
            start_byte,
            end_byte,
            signature,
            language,
        }
    }
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Heuristic parser used when no grammar-backed parser is registered.
#[derive(Debug, Default)]
pub struct HeuristicParser;

impl HeuristicParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_indentation(&self, map: &LineMap<'_>, language: Language) -> Vec<ParsedChunk> {
        let mut chunks = Vec::new();
        let mut loose_start: Option<usize> = None;
        let n = map.len();
        let mut i = 0;

        while i < n {
            let line = map.line(i);
            let trimmed = line.trim_start();
            let indent = indent_width(line);

            let decl = if indent == 0 {
                if let Some(caps) = PY_DEF_RE.captures(trimmed) {
                    Some((ChunkType::Function, caps[1].to_string()))
                } else {
                    PY_CLASS_RE
                        .captures(trimmed)
                        .map(|caps| (ChunkType::Class, caps[1].to_string()))
                }
            } else {
                None
            };

            let Some((chunk_type, symbol)) = decl else {
                if !trimmed.is_empty() && loose_start.is_none() {
                    loose_start = Some(i);
                }
                i += 1;
                continue;
            };

            // Close any pending loose block before the declaration.
            if let Some(start) = loose_start.take() {
                push_loose_block(map, &mut chunks, start, i - 1, language);
            }

            // Body: every following line that is blank or indented deeper
            // than the declaration.
            let mut end = i;
            let mut j = i + 1;
            while j < n {
                let body = map.line(j);
                if body.trim().is_empty() {
                    j += 1;
                    continue;
                }
                if indent_width(body) <= indent {
                    break;
                }
                end = j;
                j += 1;
            }

            chunks.push(map.chunk(
                i,
                end,
                chunk_type,
                Some(symbol),
                Some(trimmed.trim_end().to_string()),
                language,
            ));
            i = end + 1;
        }

        if let Some(start) = loose_start {
            push_loose_block(map, &mut chunks, start, n - 1, language);
        }
        chunks
    }

    fn parse_braced(&self, map: &LineMap<'_>, language: Language) -> Vec<ParsedChunk> {
        let mut chunks = Vec::new();
        let mut loose_start: Option<usize> = None;
        let n = map.len();
        let mut i = 0;

        while i < n {
            let line = map.line(i);
            if !line.contains('{') {
                if !line.trim().is_empty() && loose_start.is_none() {
                    loose_start = Some(i);
                }
                i += 1;
                continue;
            }

            if let Some(start) = loose_start.take() {
                push_loose_block(map, &mut chunks, start, i - 1, language);
            }

            // Walk forward balancing braces until the block closes.
            let mut depth: i32 = 0;
            let mut end = i;
            for j in i..n {
                let l = map.line(j);
                depth += l.matches('{').count() as i32;
                depth -= l.matches('}').count() as i32;
                end = j;
                if depth <= 0 {
                    break;
                }
            }

            let signature = line.trim().trim_end_matches('{').trim_end().to_string();
            let (chunk_type, symbol) = classify_brace_decl(line);
            chunks.push(map.chunk(
                i,
                end,
                chunk_type,
                symbol,
                if signature.is_empty() {
                    None
                } else {
                    Some(signature)
                },
                language,
            ));
            i = end + 1;
        }

        if let Some(start) = loose_start {
            push_loose_block(map, &mut chunks, start, n - 1, language);
        }
        chunks
    }

    /// Paragraph blocks for formats with no recognized code structure.
    /// Comment detection is skipped: `#` means a heading in Markdown, not
    /// a comment.
    fn parse_blocks(&self, map: &LineMap<'_>, language: Language) -> Vec<ParsedChunk> {
        let mut chunks = Vec::new();
        let n = map.len();
        let mut start: Option<usize> = None;

        let mut push = |chunks: &mut Vec<ParsedChunk>, s: usize, e: usize| {
            chunks.push(map.chunk(s, e, ChunkType::Block, None, None, language));
        };

        for i in 0..n {
            let blank = map.line(i).trim().is_empty();
            match (start, blank) {
                (None, false) => start = Some(i),
                (Some(s), true) => {
                    push(&mut chunks, s, i - 1);
                    start = None;
                }
                (Some(s), false) if i - s + 1 >= MAX_BLOCK_LINES => {
                    push(&mut chunks, s, i);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            push(&mut chunks, s, n - 1);
        }
        chunks
    }
}

/// Emit a Block (or Comment) chunk for a loose line range, trimming blank
/// edges. Skips ranges that are entirely blank.
fn push_loose_block(
    map: &LineMap<'_>,
    chunks: &mut Vec<ParsedChunk>,
    mut start: usize,
    mut end: usize,
    language: Language,
) {
    while start <= end && map.line(start).trim().is_empty() {
        start += 1;
    }
    while end > start && map.line(end).trim().is_empty() {
        end -= 1;
    }
    if start > end || map.line(start).trim().is_empty() {
        return;
    }

    let all_comments = (start..=end).all(|i| {
        let t = map.line(i).trim();
        t.is_empty() || t.starts_with('#') || t.starts_with("//") || t.starts_with('*') || t.starts_with("/*")
    });
    let chunk_type = if all_comments {
        ChunkType::Comment
    } else {
        ChunkType::Block
    };
    chunks.push(map.chunk(start, end, chunk_type, None, None, language));
}

fn classify_brace_decl(line: &str) -> (ChunkType, Option<String>) {
    if let Some(caps) = BRACE_DECL_RE.captures(line) {
        let symbol = caps[2].to_string();
        let chunk_type = match &caps[1] {
            "fn" | "func" | "function" => ChunkType::Function,
            "class" => ChunkType::Class,
            "struct" => ChunkType::Struct,
            "enum" => ChunkType::Enum,
            "trait" | "interface" => ChunkType::Interface,
            _ => ChunkType::Block,
        };
        return (chunk_type, Some(symbol));
    }
    // `name(...) {` without a keyword: C functions, Java methods.
    if let Some(caps) = CALLABLE_RE.captures(line) {
        return (ChunkType::Function, Some(caps[1].to_string()));
    }
    (ChunkType::Block, None)
}

impl CodeParser for HeuristicParser {
    fn parse(&self, path: &Path, text: &str) -> Result<Vec<ParsedChunk>, ParseError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let language = Language::from_path(path);
        let map = LineMap::new(text);

        let chunks = if language.is_indentation_based() {
            self.parse_indentation(&map, language)
        } else if language.is_brace_based() {
            self.parse_braced(&map, language)
        } else {
            self.parse_blocks(&map, language)
        };
        Ok(chunks)
    }
}
