//! Indexing coordinator: parse → chunk → diff → persist → embed.
//!
//! `process_file` is idempotent: an unchanged file is a no-op, and a
//! changed file's chunk set is replaced inside a single transaction so
//! readers never observe a partial state. Unchanged chunks keep their rows
//! and embeddings; only new or modified chunks are (re-)embedded.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::IndexingConfig;
use crate::discovery::FileDiscoveryCache;
use crate::embedding::EmbeddingService;
use crate::parser::{Language, ParsedChunk, ParserRegistry};
use crate::store::{NewChunk, NewFile, StorageEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Success,
    UpToDate,
    Skipped,
    Error,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Success => "success",
            ProcessStatus::UpToDate => "up_to_date",
            ProcessStatus::Skipped => "skipped",
            ProcessStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of processing one file.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub status: ProcessStatus,
    pub chunks: usize,
    pub embeddings: usize,
    pub error: Option<String>,
}

impl ProcessResult {
    fn up_to_date() -> Self {
        Self {
            status: ProcessStatus::UpToDate,
            chunks: 0,
            embeddings: 0,
            error: None,
        }
    }

    fn skipped(reason: &str) -> Self {
        Self {
            status: ProcessStatus::Skipped,
            chunks: 0,
            embeddings: 0,
            error: Some(reason.to_string()),
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: ProcessStatus::Error,
            chunks: 0,
            embeddings: 0,
            error: Some(message),
        }
    }
}

/// Aggregate outcome of a directory run.
#[derive(Debug, Clone, Default)]
pub struct DirectoryReport {
    pub files_processed: usize,
    pub total_files: usize,
    pub total_chunks: usize,
    pub total_embeddings: usize,
    pub orphans_removed: usize,
    pub errors: Vec<String>,
}

pub struct IndexingCoordinator {
    store: Arc<StorageEngine>,
    parsers: Arc<ParserRegistry>,
    embedding_service: Option<Arc<EmbeddingService>>,
    discovery: Arc<FileDiscoveryCache>,
    config: IndexingConfig,
}

impl IndexingCoordinator {
    pub fn new(
        store: Arc<StorageEngine>,
        parsers: Arc<ParserRegistry>,
        embedding_service: Option<Arc<EmbeddingService>>,
        config: IndexingConfig,
    ) -> Self {
        let discovery = Arc::new(FileDiscoveryCache::new(!config.ignore_gitignore));
        Self {
            store,
            parsers,
            embedding_service,
            discovery,
            config,
        }
    }

    pub fn store(&self) -> &Arc<StorageEngine> {
        &self.store
    }

    pub fn discovery(&self) -> &Arc<FileDiscoveryCache> {
        &self.discovery
    }

    /// Index one file. Never panics or propagates: every failure comes
    /// back as a `ProcessStatus::Error` result.
    pub async fn process_file(&self, path: &Path, skip_embeddings: bool) -> ProcessResult {
        match self.process_file_inner(path, skip_embeddings).await {
            Ok(result) => result,
            Err(message) => {
                tracing::warn!(path = %path.display(), error = %message, "File processing failed");
                ProcessResult::error(message)
            }
        }
    }

    async fn process_file_inner(
        &self,
        path: &Path,
        skip_embeddings: bool,
    ) -> Result<ProcessResult, String> {
        let canonical = dunce::canonicalize(path).map_err(|e| format!("canonicalize: {}", e))?;
        let path_str = canonical.to_string_lossy().replace('\\', "/");

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| format!("stat: {}", e))?;
        let size = metadata.len();
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let existing = self
            .store
            .get_file_by_path(&path_str)
            .await
            .map_err(|e| e.to_string())?;

        // Change gate: size equal and mtime within epsilon means unchanged,
        // optionally verified by a sampled checksum.
        let mut verified_checksum: Option<String> = None;
        if let Some(ref file) = existing {
            if !self.config.force_reindex
                && file.size == size as i64
                && (file.modified_time - mtime).abs() <= self.config.mtime_epsilon_seconds
            {
                if !self.config.verify_checksum_when_mtime_equal {
                    return Ok(ProcessResult::up_to_date());
                }
                let checksum = self.compute_checksum(&canonical).await?;
                match &file.checksum {
                    Some(stored) if *stored == checksum => {
                        return Ok(ProcessResult::up_to_date());
                    }
                    // Missing or mismatching checksum: reprocess (and
                    // populate the checksum column this pass).
                    _ => verified_checksum = Some(checksum),
                }
            }
        }

        // Safety gates.
        if size > self.config.max_file_size_bytes() {
            return Ok(ProcessResult::skipped(&format!(
                "file exceeds max_file_size_mb ({} bytes)",
                size
            )));
        }
        let language = Language::from_path(&canonical);
        if language.is_structured_config()
            && size > self.config.config_file_size_threshold_kb * 1024
        {
            return Ok(ProcessResult::skipped(
                "structured config file over size threshold",
            ));
        }

        let bytes = tokio::fs::read(&canonical)
            .await
            .map_err(|e| format!("read: {}", e))?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let checksum = if self.config.verify_checksum_when_mtime_equal {
            match verified_checksum {
                Some(c) => Some(c),
                None => Some(sampled_checksum(&bytes, self.config.checksum_sample_kb)),
            }
        } else {
            None
        };

        // Parse on a blocking worker; a pathological file must not stall
        // the runtime. The timeout applies only to files large enough for
        // parsing cost to matter.
        let parsed = self.parse_with_timeout(&canonical, text, size).await?;

        // Diff against stored chunks: same (type, symbol, byte range,
        // code hash) means the chunk row and its embeddings survive.
        let (file_id, inserted_ids, total_chunks) = match existing {
            Some(file) => {
                let current = self
                    .store
                    .get_chunks_by_file_id(file.id)
                    .await
                    .map_err(|e| e.to_string())?;

                let mut existing_by_key: HashMap<ChunkKey, Vec<i64>> = HashMap::new();
                for chunk in &current {
                    existing_by_key
                        .entry(ChunkKey::of(
                            &chunk.chunk_type.to_string(),
                            chunk.symbol.as_deref(),
                            chunk.start_byte,
                            chunk.end_byte,
                            &chunk.code,
                        ))
                        .or_default()
                        .push(chunk.id);
                }

                let mut to_insert = Vec::new();
                let mut kept = 0usize;
                for chunk in &parsed {
                    let key = ChunkKey::of(
                        &chunk.chunk_type.to_string(),
                        chunk.symbol.as_deref(),
                        chunk.start_byte as i64,
                        chunk.end_byte as i64,
                        &chunk.code,
                    );
                    match existing_by_key.get_mut(&key).and_then(|ids| ids.pop()) {
                        Some(_) => kept += 1,
                        None => to_insert.push(NewChunk::from_parsed(file.id, chunk)),
                    }
                }
                let to_delete: Vec<i64> =
                    existing_by_key.into_values().flatten().collect();

                let inserted = self
                    .store
                    .replace_file_chunks(
                        file.id,
                        &to_delete,
                        &to_insert,
                        size as i64,
                        mtime,
                        checksum.as_deref(),
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                (file.id, inserted, kept + to_insert.len())
            }
            None => {
                // New file: insert the row with a sentinel mtime so a crash
                // between the two writes forces a clean reprocess, then let
                // the atomic replace set the real metadata with the chunks.
                let file_id = self
                    .store
                    .insert_file(&NewFile {
                        path: path_str.clone(),
                        name: canonical
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        extension: canonical
                            .extension()
                            .map(|e| e.to_string_lossy().into_owned()),
                        size: size as i64,
                        modified_time: 0.0,
                        language,
                        checksum: None,
                    })
                    .await
                    .map_err(|e| e.to_string())?;

                let to_insert: Vec<NewChunk> = parsed
                    .iter()
                    .map(|chunk| NewChunk::from_parsed(file_id, chunk))
                    .collect();
                let inserted = self
                    .store
                    .replace_file_chunks(
                        file_id,
                        &[],
                        &to_insert,
                        size as i64,
                        mtime,
                        checksum.as_deref(),
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                let count = inserted.len();
                (file_id, inserted, count)
            }
        };

        let mut embeddings = 0usize;
        if !skip_embeddings && !inserted_ids.is_empty() {
            if let Some(service) = &self.embedding_service {
                match service.embed_chunks(&inserted_ids).await {
                    Ok(report) => embeddings = report.embedded,
                    Err(e) => {
                        tracing::warn!(file_id, error = %e, "Embedding generation failed");
                    }
                }
            }
        }

        tracing::debug!(
            path = %path_str,
            chunks = total_chunks,
            inserted = inserted_ids.len(),
            embeddings,
            "File processed"
        );
        Ok(ProcessResult {
            status: ProcessStatus::Success,
            chunks: total_chunks,
            embeddings,
            error: None,
        })
    }

    async fn parse_with_timeout(
        &self,
        path: &Path,
        text: String,
        size: u64,
    ) -> Result<Vec<ParsedChunk>, String> {
        let parsers = Arc::clone(&self.parsers);
        let path_owned = path.to_path_buf();
        let parse_task =
            tokio::task::spawn_blocking(move || parsers.parse(&path_owned, &text));

        let timeout_applies = self.config.per_file_timeout_seconds > 0.0
            && size >= self.config.per_file_timeout_min_size_kb * 1024;

        let joined = if timeout_applies {
            match tokio::time::timeout(
                Duration::from_secs_f64(self.config.per_file_timeout_seconds),
                parse_task,
            )
            .await
            {
                Ok(joined) => joined,
                Err(_) => {
                    return Err(format!(
                        "parse timed out after {}s",
                        self.config.per_file_timeout_seconds
                    ));
                }
            }
        } else {
            parse_task.await
        };

        joined
            .map_err(|e| format!("parse task failed: {}", e))?
            .map_err(|e| e.to_string())
    }

    async fn compute_checksum(&self, path: &Path) -> Result<String, String> {
        let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
        let sample_kb = self.config.checksum_sample_kb;
        Ok(tokio::task::spawn_blocking(move || sampled_checksum(&bytes, sample_kb))
            .await
            .map_err(|e| e.to_string())?)
    }

    /// Index every matching file under `root`. Per-file errors are
    /// collected, never fatal. When cleanup is enabled, file rows whose
    /// paths no longer exist are removed afterwards (cascading).
    pub async fn process_directory(
        &self,
        root: &Path,
        include: Option<&[String]>,
        exclude: Option<&[String]>,
    ) -> Result<DirectoryReport, crate::Error> {
        let include = include.unwrap_or(&self.config.include).to_vec();
        let exclude = exclude.unwrap_or(&self.config.exclude).to_vec();

        let discovery = Arc::clone(&self.discovery);
        let root_owned = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || {
            discovery.list_files(&root_owned, &include, &exclude)
        })
        .await
        .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))??;

        let mut report = DirectoryReport {
            total_files: files.len(),
            ..Default::default()
        };

        for file in &files {
            let result = self.process_file(file, false).await;
            match result.status {
                ProcessStatus::Success => {
                    report.files_processed += 1;
                    report.total_chunks += result.chunks;
                    report.total_embeddings += result.embeddings;
                }
                ProcessStatus::Error => {
                    report.errors.push(format!(
                        "{}: {}",
                        file.display(),
                        result.error.unwrap_or_else(|| "unknown error".into())
                    ));
                }
                ProcessStatus::UpToDate | ProcessStatus::Skipped => {}
            }
        }

        if self.config.cleanup {
            report.orphans_removed = self.cleanup_orphans().await?;
        }

        tracing::info!(
            processed = report.files_processed,
            total = report.total_files,
            chunks = report.total_chunks,
            errors = report.errors.len(),
            orphans = report.orphans_removed,
            "Directory processing complete"
        );
        Ok(report)
    }

    /// Remove file rows (and their chunks/embeddings) whose paths no
    /// longer exist on disk.
    pub async fn cleanup_orphans(&self) -> Result<usize, crate::Error> {
        let mut removed = 0usize;
        for path in self.store.get_all_file_paths().await? {
            if tokio::fs::metadata(&path).await.is_err() {
                if self.store.delete_file_completely(&path).await? {
                    removed += 1;
                    tracing::debug!(path = %path, "Removed orphaned file");
                }
            }
        }
        Ok(removed)
    }
}

/// Identity of a chunk for diffing: kind, symbol, byte range, and a hash of
/// the code text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChunkKey {
    chunk_type: String,
    symbol: Option<String>,
    start_byte: i64,
    end_byte: i64,
    code_hash: [u8; 32],
}

impl ChunkKey {
    fn of(
        chunk_type: &str,
        symbol: Option<&str>,
        start_byte: i64,
        end_byte: i64,
        code: &str,
    ) -> Self {
        Self {
            chunk_type: chunk_type.to_string(),
            symbol: symbol.map(str::to_string),
            start_byte,
            end_byte,
            code_hash: *blake3::hash(code.as_bytes()).as_bytes(),
        }
    }
}

/// Fast content checksum: blake3 over a head+tail sample plus the length,
/// or the full content when `sample_kb` is 0.
fn sampled_checksum(bytes: &[u8], sample_kb: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    if sample_kb == 0 || bytes.len() as u64 <= sample_kb * 1024 * 2 {
        hasher.update(bytes);
    } else {
        let sample = (sample_kb * 1024) as usize;
        hasher.update(&bytes[..sample]);
        hasher.update(&bytes[bytes.len() - sample..]);
        hasher.update(&(bytes.len() as u64).to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
