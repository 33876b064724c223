//! Core chunk and language types shared across the crate.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Programming language of a source file.
///
/// `Unknown` is a first-class value: files with unrecognized extensions are
/// still indexable as plain blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Rust,
    Go,
    C,
    Cpp,
    Java,
    CSharp,
    Ruby,
    Php,
    Swift,
    Kotlin,
    Scala,
    Markdown,
    Json,
    Yaml,
    Toml,
    Makefile,
    Text,
    Unknown,
}

impl Language {
    /// Detect language from a file path (extension or special file name).
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if matches!(name, "Makefile" | "makefile" | "GNUmakefile") {
            return Language::Makefile;
        }

        match path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "py" | "pyw" => Language::Python,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "rs" => Language::Rust,
            "go" => Language::Go,
            "c" | "h" => Language::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hxx" => Language::Cpp,
            "java" => Language::Java,
            "cs" => Language::CSharp,
            "rb" => Language::Ruby,
            "php" => Language::Php,
            "swift" => Language::Swift,
            "kt" | "kts" => Language::Kotlin,
            "scala" => Language::Scala,
            "md" | "markdown" => Language::Markdown,
            "json" => Language::Json,
            "yaml" | "yml" => Language::Yaml,
            "toml" => Language::Toml,
            "txt" => Language::Text,
            _ => Language::Unknown,
        }
    }

    /// Structured config formats get a size gate during indexing: a large
    /// generated JSON lockfile produces thousands of useless chunks.
    pub fn is_structured_config(&self) -> bool {
        matches!(self, Language::Json | Language::Yaml | Language::Toml)
    }

    /// Block structure is expressed through indentation (Python-like).
    pub fn is_indentation_based(&self) -> bool {
        matches!(self, Language::Python)
    }

    /// Block structure is expressed through braces (C-family).
    pub fn is_brace_based(&self) -> bool {
        matches!(
            self,
            Language::Rust
                | Language::C
                | Language::Cpp
                | Language::Go
                | Language::Java
                | Language::JavaScript
                | Language::TypeScript
                | Language::CSharp
                | Language::Swift
                | Language::Kotlin
                | Language::Scala
                | Language::Php
        )
    }

    /// File extensions recognized for this language (empty for Unknown and
    /// name-matched languages like Makefile).
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Language::Python => &["py", "pyw"],
            Language::JavaScript => &["js", "jsx", "mjs", "cjs"],
            Language::TypeScript => &["ts", "tsx"],
            Language::Rust => &["rs"],
            Language::Go => &["go"],
            Language::C => &["c", "h"],
            Language::Cpp => &["cpp", "cc", "cxx", "hpp", "hxx"],
            Language::Java => &["java"],
            Language::CSharp => &["cs"],
            Language::Ruby => &["rb"],
            Language::Php => &["php"],
            Language::Swift => &["swift"],
            Language::Kotlin => &["kt", "kts"],
            Language::Scala => &["scala"],
            Language::Markdown => &["md", "markdown"],
            Language::Json => &["json"],
            Language::Yaml => &["yaml", "yml"],
            Language::Toml => &["toml"],
            Language::Makefile => &[],
            Language::Text => &["txt"],
            Language::Unknown => &[],
        }
    }

    /// All languages with at least one recognized extension.
    pub fn all_supported() -> &'static [Language] {
        &[
            Language::Python,
            Language::JavaScript,
            Language::TypeScript,
            Language::Rust,
            Language::Go,
            Language::C,
            Language::Cpp,
            Language::Java,
            Language::CSharp,
            Language::Ruby,
            Language::Php,
            Language::Swift,
            Language::Kotlin,
            Language::Scala,
            Language::Markdown,
            Language::Json,
            Language::Yaml,
            Language::Toml,
            Language::Text,
        ]
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Rust => "rust",
            Language::Go => "go",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::CSharp => "csharp",
            Language::Ruby => "ruby",
            Language::Php => "php",
            Language::Swift => "swift",
            Language::Kotlin => "kotlin",
            Language::Scala => "scala",
            Language::Markdown => "markdown",
            Language::Json => "json",
            Language::Yaml => "yaml",
            Language::Toml => "toml",
            Language::Makefile => "makefile",
            Language::Text => "text",
            Language::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Language::Python),
            "javascript" => Ok(Language::JavaScript),
            "typescript" => Ok(Language::TypeScript),
            "rust" => Ok(Language::Rust),
            "go" => Ok(Language::Go),
            "c" => Ok(Language::C),
            "cpp" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            "csharp" => Ok(Language::CSharp),
            "ruby" => Ok(Language::Ruby),
            "php" => Ok(Language::Php),
            "swift" => Ok(Language::Swift),
            "kotlin" => Ok(Language::Kotlin),
            "scala" => Ok(Language::Scala),
            "markdown" => Ok(Language::Markdown),
            "json" => Ok(Language::Json),
            "yaml" => Ok(Language::Yaml),
            "toml" => Ok(Language::Toml),
            "makefile" => Ok(Language::Makefile),
            "text" => Ok(Language::Text),
            "unknown" => Ok(Language::Unknown),
            other => Err(format!("unknown language: {}", other)),
        }
    }
}

/// Kind of code element a chunk represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Function,
    Method,
    Class,
    Struct,
    Enum,
    Interface,
    Block,
    Comment,
    Unknown,
}

impl ChunkType {
    /// A complete syntactic unit needs only small padding during boundary
    /// expansion; blocks and comments get the full heuristic walk.
    pub fn is_complete_unit(&self) -> bool {
        matches!(
            self,
            ChunkType::Function
                | ChunkType::Method
                | ChunkType::Class
                | ChunkType::Struct
                | ChunkType::Enum
                | ChunkType::Interface
        )
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkType::Function => "function",
            ChunkType::Method => "method",
            ChunkType::Class => "class",
            ChunkType::Struct => "struct",
            ChunkType::Enum => "enum",
            ChunkType::Interface => "interface",
            ChunkType::Block => "block",
            ChunkType::Comment => "comment",
            ChunkType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ChunkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(ChunkType::Function),
            "method" => Ok(ChunkType::Method),
            "class" => Ok(ChunkType::Class),
            "struct" => Ok(ChunkType::Struct),
            "enum" => Ok(ChunkType::Enum),
            "interface" => Ok(ChunkType::Interface),
            "block" => Ok(ChunkType::Block),
            "comment" => Ok(ChunkType::Comment),
            "unknown" => Ok(ChunkType::Unknown),
            other => Err(format!("unknown chunk type: {}", other)),
        }
    }
}

/// A contiguous span of a source file produced by a parser.
///
/// Lines are 1-indexed and inclusive; byte offsets index into the file's
/// UTF-8 text. `code` is the exact slice `[start_byte, end_byte)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChunk {
    pub chunk_type: ChunkType,
    pub symbol: Option<String>,
    pub code: String,
    pub start_line: u32,
    pub end_line: u32,
    pub start_byte: usize,
    pub end_byte: usize,
    pub signature: Option<String>,
    pub language: Language,
}
