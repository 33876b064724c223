//! Output quality post-processing for synthesized answers.
//!
//! A verbosity filter strips meta-hedging patterns, a validator emits
//! warnings (never errors) for placeholder language, low citation density,
//! verbose output, and vague quantifiers, and a citation fallback appends
//! key files when an answer cites nothing.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::llm::estimate_tokens;

use super::node::ResearchChunk;

static VERBOSITY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)It'?s important to note that\s+",
        r"(?i)It'?s worth noting that\s+",
        r"(?i)It should be noted that\s+",
        r"(?i)However, it should be mentioned that\s+",
        r"(?i)Please note that\s+",
        r"(?i)As mentioned (?:earlier|above|previously),?\s+",
        r"(?im)^No information (?:was )?found (?:for|about)[^\n]+\n",
        r"(?im)^Unfortunately, the (?:code|analysis) does not (?:show|provide)[^\n]+\n",
        r"(?i)The (?:exact|precise|specific) (?:implementation|details?|mechanism|values?) (?:is|are) not (?:provided|documented|shown|clear|available) in the (?:code|analysis)[,.]?\s*",
        r"(?i)(?:More|Additional) (?:research|investigation|analysis|context) (?:is|would be) (?:needed|required)[,.]?\s*",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static EXCESS_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("static regex"));

/// `file.ext:123` or `file.ext:123-456`.
static CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\w/]+\.\w+:\d+(?:-\d+)?").expect("static regex"));

static VAGUE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(several|many|few|some|various|multiple|numerous)\s+(seconds|minutes|items|entries|elements|chunks)",
        r"(?i)\b(around|approximately|roughly|about)\s+\d+",
        r"(?i)\bhundreds of\b",
        r"(?i)\bthousands of\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

const THEORETICAL_PLACEHOLDERS: &[&str] = &[
    "provide exact",
    "provide precise",
    "specify exact",
    "implementation-dependent",
    "precise line-level mappings",
    "exact numeric budgets",
    "provide the actual",
    "should specify",
    "need to determine",
    "requires clarification",
];

/// Minimum citations expected in a >1000-token answer.
const MIN_CITATIONS: usize = 5;

/// Remove meta-hedging and defensive caveats from an answer.
pub fn filter_verbosity(text: &str) -> String {
    let mut filtered = text.to_string();
    for pattern in VERBOSITY_PATTERNS.iter() {
        filtered = pattern.replace_all(&filtered, "").into_owned();
    }
    let filtered = EXCESS_NEWLINES.replace_all(&filtered, "\n\n").into_owned();
    if filtered.len() != text.len() {
        tracing::debug!(
            removed = text.len() - filtered.len().min(text.len()),
            "Verbosity filter removed meta-commentary"
        );
    }
    filtered
}

/// Check an answer for quality problems. Returns warnings only.
pub fn validate_output_quality(answer: &str, target_tokens: usize) -> Vec<String> {
    let mut warnings = Vec::new();
    let lower = answer.to_lowercase();

    for placeholder in THEORETICAL_PLACEHOLDERS {
        if lower.contains(placeholder) {
            warnings.push(format!(
                "output contains theoretical placeholder: '{}'",
                placeholder
            ));
        }
    }

    let answer_tokens = estimate_tokens(answer);
    let citations = CITATION_RE.find_iter(answer).count();
    if answer_tokens > 1000 && citations < MIN_CITATIONS {
        warnings.push(format!(
            "low citation density ({} citations in {} tokens)",
            citations, answer_tokens
        ));
    }

    if target_tokens > 0 && answer_tokens as f64 > target_tokens as f64 * 1.5 {
        warnings.push(format!(
            "verbose output ({} tokens vs {} target)",
            answer_tokens, target_tokens
        ));
    }

    for pattern in VAGUE_PATTERNS.iter() {
        if let Some(m) = pattern.find(answer) {
            warnings.push(format!("vague quantifier detected: '{}'", m.as_str()));
            break;
        }
    }

    warnings
}

/// Append a "Key files referenced" list when the answer has no citations
/// but chunks were analyzed.
pub fn ensure_citations(answer: String, chunks: &[ResearchChunk]) -> String {
    if CITATION_RE.is_match(&answer) || chunks.is_empty() {
        return answer;
    }
    tracing::warn!("Answer missing file:line citations, appending key files");

    let mut key_files: Vec<String> = chunks
        .iter()
        .take(5)
        .filter(|c| !c.file_path.is_empty())
        .map(|c| format!("{}:{}", c.file_path, c.start_line))
        .collect();
    key_files.sort();
    key_files.dedup();
    if key_files.is_empty() {
        return answer;
    }

    let mut out = answer;
    out.push_str("\n\n**Key files referenced:**\n");
    for file in key_files {
        out.push_str(&format!("- {}\n", file));
    }
    out
}
