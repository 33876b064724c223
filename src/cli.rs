//! Thin CLI entry points. The interactive setup wizard and the richer
//! argument surface live outside this crate; these subcommands cover
//! indexing, search, stats, and serving MCP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{Config, McpTransport};
use crate::embedding::EmbeddingProviderRegistry;
use crate::indexing::IndexingCoordinator;
use crate::mcp::{serve_http, serve_stdio, McpServer};
use crate::parser::ParserRegistry;
use crate::search::SearchService;
use crate::store::StorageEngine;

#[derive(Parser)]
#[command(name = "chunkhound", version, about = "Local code search for AI agents")]
pub struct Cli {
    /// Project root to operate on.
    #[arg(long, default_value = ".")]
    pub path: PathBuf,

    /// Explicit config file (merged below .chunkhound.json).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Index the project directory (parse + chunk + persist).
    Index,
    /// Regex search over indexed chunks.
    Search {
        pattern: String,
        #[arg(long, default_value_t = 10)]
        page_size: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Restrict to paths containing this fragment.
        #[arg(long)]
        path_filter: Option<String>,
    },
    /// Print storage statistics.
    Stats,
    /// Run the MCP server (transport from config: stdio or http).
    Mcp,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let project_root = dunce::canonicalize(&cli.path)
        .with_context(|| format!("project root not found: {}", cli.path.display()))?;

    let overlay = cli.debug.then(|| serde_json::json!({"debug": true}));
    let config = Config::load(&project_root, cli.config.as_deref(), overlay)?;

    let stdio_mode =
        matches!(cli.command, Command::Mcp) && config.mcp.transport == McpTransport::Stdio;
    init_tracing(&project_root, stdio_mode, config.debug);

    match cli.command {
        Command::Index => {
            let store = Arc::new(
                StorageEngine::connect(&config.database.resolved_path(&project_root)).await?,
            );
            let coordinator = IndexingCoordinator::new(
                Arc::clone(&store),
                Arc::new(ParserRegistry::new()),
                None,
                config.indexing.clone(),
            );
            let report = coordinator
                .process_directory(&project_root, None, None)
                .await?;
            println!(
                "Indexed {}/{} files, {} chunks ({} orphans removed)",
                report.files_processed,
                report.total_files,
                report.total_chunks,
                report.orphans_removed
            );
            for error in &report.errors {
                eprintln!("error: {}", error);
            }
            store.disconnect().await?;
            Ok(())
        }
        Command::Search {
            pattern,
            page_size,
            offset,
            path_filter,
        } => {
            let db_path = config.database.resolved_path(&project_root);
            if !db_path.exists() {
                bail!("No index found. Run 'chunkhound index' first.");
            }
            let store = Arc::new(StorageEngine::connect(&db_path).await?);
            let search = SearchService::new(
                Arc::clone(&store),
                Arc::new(EmbeddingProviderRegistry::new()),
            );
            let (rows, pagination) = search
                .search_regex(&pattern, page_size, offset, path_filter.as_deref())
                .await?;
            for row in &rows {
                println!(
                    "{}:{}-{} [{}] {}",
                    row.file_path,
                    row.start_line,
                    row.end_line,
                    row.chunk_type,
                    row.symbol.as_deref().unwrap_or("-")
                );
            }
            println!(
                "{} of {} matches (offset {})",
                rows.len(),
                pagination.total,
                pagination.offset
            );
            store.disconnect().await?;
            Ok(())
        }
        Command::Stats => {
            let db_path = config.database.resolved_path(&project_root);
            if !db_path.exists() {
                bail!("No index found. Run 'chunkhound index' first.");
            }
            let store = StorageEngine::connect(&db_path).await?;
            let stats = store.get_stats().await?;
            println!("files:      {}", stats.files);
            println!("chunks:     {}", stats.chunks);
            println!("embeddings: {}", stats.embeddings);
            println!("providers:  {}", stats.providers);
            store.disconnect().await?;
            Ok(())
        }
        Command::Mcp => {
            // Embedding providers are registered by external integrations;
            // the stock binary serves regex search and stats without any.
            let registry = EmbeddingProviderRegistry::new();
            let transport = config.mcp.transport;
            let server = McpServer::initialize(config, &project_root, registry)
                .await
                .context("MCP server startup failed")?;

            let result = match transport {
                McpTransport::Stdio => serve_stdio(Arc::clone(&server)).await,
                McpTransport::Http => serve_http(Arc::clone(&server)).await,
            };
            server.shutdown().await?;
            result?;
            Ok(())
        }
    }
}

/// Logging setup. In stdio MCP mode stdout belongs to JSON-RPC: logs go to
/// a debug file only when `CHUNKHOUND_DEBUG` is set, otherwise nowhere.
fn init_tracing(project_root: &std::path::Path, stdio_mode: bool, debug: bool) {
    let filter = if debug { "debug" } else { "info" };

    if stdio_mode {
        if std::env::var("CHUNKHOUND_DEBUG").is_ok() {
            let log_dir = project_root.join(".chunkhound");
            let _ = std::fs::create_dir_all(&log_dir);
            if let Ok(file) = std::fs::File::create(log_dir.join("mcp-debug.log")) {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(
                        tracing_subscriber::EnvFilter::try_from_default_env()
                            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
                    )
                    .with_writer(move || file.try_clone().expect("log file clone"))
                    .with_ansi(false)
                    .try_init();
            }
        }
        // No CHUNKHOUND_DEBUG: no subscriber, nothing can leak to stdout.
        return;
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
