//! Smart boundary expansion.
//!
//! Widens a chunk's line window to the nearest enclosing complete
//! syntactic unit: indentation walking for Python-like files, brace
//! balancing for C-family files. Chunks already marked as complete units
//! only get a few lines of padding.

use crate::parser::Language;

use super::budget::MAX_BOUNDARY_EXPANSION_LINES;

/// Padding around chunks that are already complete units (decorators,
/// docstrings, attributes).
const COMPLETE_UNIT_PADDING: usize = 3;

/// How far backward/forward the heuristic walks before giving up.
const WALK_LIMIT: usize = 200;

/// Expand `[start_line, end_line]` (1-indexed, inclusive) to natural code
/// boundaries. `is_complete_unit` short-circuits to padding only.
pub fn expand_to_natural_boundaries(
    lines: &[&str],
    start_line: usize,
    end_line: usize,
    is_complete_unit: bool,
    language: Language,
) -> (usize, usize) {
    if lines.is_empty() {
        return (start_line, end_line);
    }

    if is_complete_unit {
        let start = start_line.saturating_sub(COMPLETE_UNIT_PADDING).max(1);
        let end = (end_line + COMPLETE_UNIT_PADDING).min(lines.len());
        return (start, end.max(start));
    }

    // 0-indexed working copies, clamped to the file.
    let start_idx = start_line.saturating_sub(1).min(lines.len() - 1);
    let end_idx = end_line.saturating_sub(1).min(lines.len() - 1);

    let (mut expanded_start, mut expanded_end) = if language.is_indentation_based() {
        expand_indentation(lines, start_idx, end_idx)
    } else if language.is_brace_based() {
        expand_braces(lines, start_idx, end_idx)
    } else {
        (start_idx, end_idx)
    };

    if expanded_end < expanded_start {
        expanded_end = expanded_start;
    }
    if expanded_end - expanded_start > MAX_BOUNDARY_EXPANSION_LINES {
        expanded_end = expanded_start + MAX_BOUNDARY_EXPANSION_LINES;
    }

    (expanded_start + 1, expanded_end + 1)
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Python-like: walk backward to the nearest `def`/`class`, forward to the
/// first non-empty line dedented back to the block start.
fn expand_indentation(lines: &[&str], start_idx: usize, end_idx: usize) -> (usize, usize) {
    let mut expanded_start = start_idx;
    let lower = start_idx.saturating_sub(WALK_LIMIT);
    for i in (lower..start_idx).rev() {
        let trimmed = lines[i].trim_start();
        if trimmed.starts_with("def ")
            || trimmed.starts_with("class ")
            || trimmed.starts_with("async def ")
        {
            expanded_start = i;
            break;
        }
        // Module boundary: a blank line followed by an unindented line.
        if lines[i].trim().is_empty() && i + 1 < lines.len() {
            let next = lines[i + 1];
            if !next.trim().is_empty() && indent_of(next) == 0 && i < start_idx {
                break;
            }
        }
    }

    let start_indent = indent_of(lines[expanded_start]);
    let mut expanded_end = end_idx;
    let mut found_dedent = false;
    let upper = (end_idx + 1 + WALK_LIMIT).min(lines.len());
    for (i, line) in lines.iter().enumerate().take(upper).skip(end_idx + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= start_indent {
            expanded_end = i - 1;
            found_dedent = true;
            break;
        }
        expanded_end = i;
    }
    if !found_dedent && upper == lines.len() && end_idx + 1 < lines.len() {
        expanded_end = lines.len() - 1;
    }

    (expanded_start, expanded_end)
}

/// Brace-based: walk backward balancing braces to the opening `{` and its
/// signature line, forward to the matching `}`.
fn expand_braces(lines: &[&str], start_idx: usize, end_idx: usize) -> (usize, usize) {
    let mut expanded_start = start_idx;
    let mut depth: i32 = 0;
    let lower = start_idx.saturating_sub(WALK_LIMIT);
    for i in (lower..=start_idx).rev() {
        let line = lines[i];
        depth += line.matches('}').count() as i32;
        depth -= line.matches('{').count() as i32;

        if depth < 0 && line.contains('{') {
            // Found the enclosing opening brace; look for the signature.
            expanded_start = i;
            for j in (i.saturating_sub(10)..=i).rev() {
                let sig = lines[j].trim();
                if sig.contains('(') {
                    expanded_start = j;
                    break;
                }
            }
            break;
        }
    }

    let mut expanded_end = end_idx;
    let mut depth: i32 = 0;
    let upper = (end_idx + WALK_LIMIT).min(lines.len() - 1);
    for (i, line) in lines
        .iter()
        .enumerate()
        .take(upper + 1)
        .skip(expanded_start)
    {
        depth += line.matches('{').count() as i32;
        depth -= line.matches('}').count() as i32;
        if depth == 0 && i > expanded_start && line.contains('}') {
            expanded_end = i;
            break;
        }
    }

    (expanded_start, expanded_end.max(end_idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(text: &str) -> Vec<&str> {
        text.lines().collect()
    }

    #[test]
    fn test_complete_unit_gets_padding_only() {
        let text = "a\nb\nc\nd\ne\nf\ng\nh\ni\nj";
        let lines = split(text);
        let (start, end) =
            expand_to_natural_boundaries(&lines, 5, 6, true, Language::Python);
        assert_eq!((start, end), (2, 9));
    }

    #[test]
    fn test_complete_unit_padding_clamps_to_file() {
        let lines = split("a\nb\nc");
        let (start, end) =
            expand_to_natural_boundaries(&lines, 1, 3, true, Language::Rust);
        assert_eq!((start, end), (1, 3));
    }

    #[test]
    fn test_python_expands_to_enclosing_def() {
        let text = "import os\n\ndef outer():\n    x = 1\n    y = 2\n    return x + y\n\nprint(outer())\n";
        let lines = split(text);
        // A fragment inside the function body (lines 4-5).
        let (start, end) =
            expand_to_natural_boundaries(&lines, 4, 5, false, Language::Python);
        assert_eq!(start, 3, "should walk back to the def line");
        assert_eq!(end, 7, "should stop before the dedented line");
    }

    #[test]
    fn test_brace_expands_to_enclosing_function() {
        let text = "fn top() {\n    let a = 1;\n    if a > 0 {\n        work();\n    }\n    done();\n}\n\nfn next() {}\n";
        let lines = split(text);
        // A fragment inside the if-block (line 4).
        let (start, end) = expand_to_natural_boundaries(&lines, 4, 4, false, Language::Rust);
        assert_eq!(start, 1, "should walk back to the fn signature");
        assert_eq!(end, 7, "should walk forward to the matching close brace");
    }

    #[test]
    fn test_expansion_clipped_to_limit() {
        let body = "    x()\n".repeat(500);
        let text = format!("def big():\n{}", body);
        let lines: Vec<&str> = text.lines().collect();
        let (start, end) =
            expand_to_natural_boundaries(&lines, 400, 402, false, Language::Python);
        assert!(end - start <= MAX_BOUNDARY_EXPANSION_LINES);
    }

    #[test]
    fn test_unknown_language_unchanged() {
        let lines = split("a\nb\nc\nd");
        let (start, end) =
            expand_to_natural_boundaries(&lines, 2, 3, false, Language::Markdown);
        assert_eq!((start, end), (2, 3));
    }
}
