//! Layered configuration.
//!
//! Sources are merged low→high: built-in defaults → environment variables
//! (`CHUNKHOUND_` prefix, `__` for nesting) → explicit config file →
//! project-local `.chunkhound.json` → CLI overrides. Objects deep-merge,
//! arrays are replaced wholesale. All layering happens on `serde_json::Value`
//! so every source goes through the same merge path.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Environment variable prefix, e.g. `CHUNKHOUND_MCP__PORT=4000`.
pub const ENV_PREFIX: &str = "CHUNKHOUND_";

/// Project-local config file name.
pub const LOCAL_CONFIG_FILE: &str = ".chunkhound.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("path filter contains forbidden pattern: {0}")]
    PathFilter(String),
    #[error("no embedding provider configured")]
    NoEmbeddingProvider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseProviderKind {
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file path. Defaults to `<project>/.chunkhound/db`.
    pub path: Option<PathBuf>,
    pub provider: DatabaseProviderKind,
    /// Accepted for compatibility with configs written for the alternative
    /// vector store; unused by the SQLite engine.
    pub lancedb_index_type: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            provider: DatabaseProviderKind::Sqlite,
            lancedb_index_type: None,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the database path against a project root.
    pub fn resolved_path(&self, project_root: &Path) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| project_root.join(".chunkhound").join("db"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingProviderKind {
    Openai,
    OpenaiCompatible,
    Voyageai,
    Ollama,
    Tei,
    BgeInIcl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: Option<EmbeddingProviderKind>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub batch_size: usize,
    pub max_concurrent: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            api_key: None,
            base_url: None,
            batch_size: 100,
            max_concurrent: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub transport: McpTransport,
    pub host: String,
    /// 0 means OS-assigned; otherwise must be in 1024..=65535.
    pub port: u16,
    pub cors: bool,
    pub allowed_origins: Vec<String>,
    pub max_response_tokens: usize,
    /// Seconds.
    pub request_timeout: u64,
    pub max_concurrent_requests: usize,
    pub response_cache_size: usize,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            transport: McpTransport::Stdio,
            host: "localhost".into(),
            port: 3000,
            cors: false,
            allowed_origins: vec!["*".into()],
            max_response_tokens: 20_000,
            request_timeout: 60,
            max_concurrent_requests: 10,
            response_cache_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub force_reindex: bool,
    pub batch_size: usize,
    pub db_batch_size: usize,
    pub max_concurrent: usize,
    pub cleanup: bool,
    pub ignore_gitignore: bool,
    pub max_file_size_mb: u64,
    /// Structured config files (JSON/YAML/TOML) above this size are skipped.
    pub config_file_size_threshold_kb: u64,
    /// 0 disables the parse timeout.
    pub per_file_timeout_seconds: f64,
    /// Timeout only applies to files at or above this size.
    pub per_file_timeout_min_size_kb: u64,
    /// Tolerance when comparing filesystem and stored mtimes.
    pub mtime_epsilon_seconds: f64,
    pub verify_checksum_when_mtime_equal: bool,
    /// Head+tail sample size for the fast checksum; 0 = full file.
    pub checksum_sample_kb: u64,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            force_reindex: false,
            batch_size: 50,
            db_batch_size: 100,
            max_concurrent: 5,
            cleanup: true,
            ignore_gitignore: false,
            max_file_size_mb: 10,
            config_file_size_threshold_kb: 20,
            per_file_timeout_seconds: 3.0,
            per_file_timeout_min_size_kb: 128,
            mtime_epsilon_seconds: 0.01,
            verify_checksum_when_mtime_equal: false,
            checksum_sample_kb: 64,
            include: default_include_patterns(),
            exclude: default_exclude_patterns(),
        }
    }
}

impl IndexingConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// Glob patterns covering every supported language extension plus Makefile
/// variants. Single source of truth for default file discovery.
pub fn default_include_patterns() -> Vec<String> {
    use crate::parser::Language;

    let mut patterns: Vec<String> = Language::all_supported()
        .iter()
        .flat_map(|l| l.extensions())
        .map(|ext| format!("**/*.{}", ext))
        .collect();
    patterns.extend(
        ["**/Makefile", "**/makefile", "**/GNUmakefile", "**/gnumakefile"]
            .map(String::from),
    );
    patterns
}

/// Default exclusions: VCS, build outputs, caches, minified and lock files.
pub fn default_exclude_patterns() -> Vec<String> {
    [
        // Virtual environments and package managers
        "**/node_modules/**",
        "**/.git/**",
        "**/__pycache__/**",
        "**/venv/**",
        "**/.venv/**",
        "**/.mypy_cache/**",
        // Build artifacts and distributions
        "**/dist/**",
        "**/build/**",
        "**/target/**",
        "**/.pytest_cache/**",
        // IDE and editor files
        "**/.vscode/**",
        "**/.idea/**",
        "**/.vs/**",
        // Cache and temporary directories
        "**/.cache/**",
        "tmp/**",
        "**/temp/**",
        // Static site generator output
        "**/.docusaurus/**",
        "**/.next/**",
        "**/out/**",
        "**/.nuxt/**",
        "**/.vuepress/dist/**",
        // Editor temp files
        "**/*.swp",
        "**/*.swo",
        "**/*~",
        "**/*.bak",
        "**/*.old",
        "**/#*#",
        // Minified and generated files
        "**/*.min.js",
        "**/*.min.css",
        "**/bundle.js",
        "**/vendor.js",
        "**/*.bundle.js",
        "**/*.chunk.js",
        // Lock and data files
        "**/*-lock.json",
        "**/package-lock.json",
        "**/yarn.lock",
        "**/composer.lock",
        "**/*.min.json",
    ]
    .map(String::from)
    .to_vec()
}

/// Root configuration value, built once per process during startup and
/// passed explicitly through the call tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub mcp: McpConfig,
    pub indexing: IndexingConfig,
    pub debug: bool,
}

impl Config {
    /// Load configuration for a project with full layering.
    ///
    /// `explicit_file` is the `--config` CLI argument; `cli_overlay` is a
    /// JSON object of CLI-provided overrides (highest precedence).
    pub fn load(
        project_root: &Path,
        explicit_file: Option<&Path>,
        cli_overlay: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut merged = serde_json::to_value(Config::default())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        deep_merge(&mut merged, env_overlay(std::env::vars()));

        if let Some(path) = explicit_file {
            deep_merge(&mut merged, read_json_file(path)?);
        }

        let local = project_root.join(LOCAL_CONFIG_FILE);
        if local.is_file() {
            deep_merge(&mut merged, read_json_file(&local)?);
        }

        if let Some(overlay) = cli_overlay {
            deep_merge(&mut merged, overlay);
        }

        let config: Config = serde_json::from_value(merged)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;

        tracing::debug!(
            transport = ?config.mcp.transport,
            provider = ?config.embedding.provider,
            include = config.indexing.include.len(),
            exclude = config.indexing.exclude.len(),
            "Effective config after merge"
        );
        Ok(config)
    }

    /// Validate ranges the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mcp.port != 0 && self.mcp.port < 1024 {
            return Err(ConfigError::Invalid(format!(
                "mcp.port must be 0 (OS-assigned) or in 1024..=65535, got {}",
                self.mcp.port
            )));
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigError::Invalid("embedding.batch_size must be > 0".into()));
        }
        if self.embedding.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "embedding.max_concurrent must be > 0".into(),
            ));
        }
        if self.indexing.mtime_epsilon_seconds < 0.0 {
            return Err(ConfigError::Invalid(
                "indexing.mtime_epsilon_seconds must be >= 0".into(),
            ));
        }
        if self.indexing.per_file_timeout_seconds < 0.0 {
            return Err(ConfigError::Invalid(
                "indexing.per_file_timeout_seconds must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

fn read_json_file(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Build a JSON overlay from `CHUNKHOUND_`-prefixed environment variables.
///
/// `__` separates nesting levels: `CHUNKHOUND_MCP__PORT=4000` becomes
/// `{"mcp": {"port": 4000}}`. Values parse as JSON when possible (numbers,
/// booleans, arrays) and fall back to plain strings.
fn env_overlay(vars: impl Iterator<Item = (String, String)>) -> Value {
    let mut overlay = Value::Object(serde_json::Map::new());

    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        // CHUNKHOUND_DEBUG=1 style top-level keys have no separator.
        let segments: Vec<String> = rest.split("__").map(|s| s.to_lowercase()).collect();
        if segments.iter().any(|s| s.is_empty()) {
            continue;
        }

        let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));

        let mut cursor = &mut overlay;
        for segment in &segments[..segments.len() - 1] {
            cursor = cursor
                .as_object_mut()
                .expect("overlay cursor is always an object")
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if !cursor.is_object() {
                *cursor = Value::Object(serde_json::Map::new());
            }
        }
        if let Some(map) = cursor.as_object_mut() {
            map.insert(segments[segments.len() - 1].clone(), value);
        }
    }

    overlay
}

/// Merge `overlay` into `base`. Objects merge recursively; everything else
/// (including arrays) replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mcp.port, 3000);
        assert_eq!(config.mcp.max_response_tokens, 20_000);
        assert_eq!(config.indexing.max_file_size_mb, 10);
        assert!((config.indexing.mtime_epsilon_seconds - 0.01).abs() < f64::EPSILON);
        assert!(config
            .indexing
            .include
            .iter()
            .any(|p| p == "**/*.py"));
        assert!(config
            .indexing
            .exclude
            .iter()
            .any(|p| p == "**/node_modules/**"));
    }

    #[test]
    fn test_deep_merge_objects() {
        let mut base = serde_json::json!({"mcp": {"port": 3000, "host": "localhost"}});
        deep_merge(&mut base, serde_json::json!({"mcp": {"port": 4000}}));
        assert_eq!(base["mcp"]["port"], 4000);
        assert_eq!(base["mcp"]["host"], "localhost");
    }

    #[test]
    fn test_deep_merge_arrays_replace() {
        let mut base = serde_json::json!({"indexing": {"include": ["**/*.py", "**/*.rs"]}});
        deep_merge(
            &mut base,
            serde_json::json!({"indexing": {"include": ["**/*.go"]}}),
        );
        assert_eq!(
            base["indexing"]["include"],
            serde_json::json!(["**/*.go"])
        );
    }

    #[test]
    fn test_env_overlay_nesting() {
        let vars = vec![
            ("CHUNKHOUND_MCP__PORT".to_string(), "4000".to_string()),
            (
                "CHUNKHOUND_EMBEDDING__BATCH_SIZE".to_string(),
                "32".to_string(),
            ),
            ("CHUNKHOUND_DEBUG".to_string(), "true".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let overlay = env_overlay(vars.into_iter());
        assert_eq!(overlay["mcp"]["port"], 4000);
        assert_eq!(overlay["embedding"]["batch_size"], 32);
        assert_eq!(overlay["debug"], true);
        assert!(overlay.get("unrelated").is_none());
    }

    #[test]
    fn test_env_overlay_string_values() {
        let vars = vec![(
            "CHUNKHOUND_EMBEDDING__MODEL".to_string(),
            "text-embedding-3-small".to_string(),
        )];
        let overlay = env_overlay(vars.into_iter());
        assert_eq!(overlay["embedding"]["model"], "text-embedding-3-small");
    }

    #[test]
    fn test_local_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(LOCAL_CONFIG_FILE),
            r#"{"mcp": {"port": 4100}, "debug": true}"#,
        )
        .unwrap();

        let config = Config::load(dir.path(), None, None).unwrap();
        assert_eq!(config.mcp.port, 4100);
        assert!(config.debug);
        // Untouched sections keep defaults.
        assert_eq!(config.mcp.host, "localhost");
    }

    #[test]
    fn test_cli_overlay_wins_over_local() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(LOCAL_CONFIG_FILE),
            r#"{"mcp": {"port": 4100}}"#,
        )
        .unwrap();

        let config = Config::load(
            dir.path(),
            None,
            Some(serde_json::json!({"mcp": {"port": 5000}})),
        )
        .unwrap();
        assert_eq!(config.mcp.port, 5000);
    }

    #[test]
    fn test_explicit_file_below_local() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("global.json");
        std::fs::write(&explicit, r#"{"mcp": {"port": 2048, "cors": true}}"#).unwrap();
        std::fs::write(
            dir.path().join(LOCAL_CONFIG_FILE),
            r#"{"mcp": {"port": 4100}}"#,
        )
        .unwrap();

        let config = Config::load(dir.path(), Some(&explicit), None).unwrap();
        // Local overrides explicit for port, explicit's cors survives.
        assert_eq!(config.mcp.port, 4100);
        assert!(config.mcp.cors);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let config = Config {
            mcp: McpConfig {
                port: 80,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_zero_allowed() {
        let config = Config {
            mcp: McpConfig {
                port: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_local_config_errors() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOCAL_CONFIG_FILE), "not json {{{").unwrap();
        let err = Config::load(dir.path(), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_database_path_resolution() {
        let config = Config::default();
        let resolved = config.database.resolved_path(Path::new("/proj"));
        assert_eq!(resolved, PathBuf::from("/proj/.chunkhound/db"));

        let explicit = DatabaseConfig {
            path: Some(PathBuf::from("/elsewhere/db")),
            ..Default::default()
        };
        assert_eq!(
            explicit.resolved_path(Path::new("/proj")),
            PathBuf::from("/elsewhere/db")
        );
    }
}
