//! Hybrid storage engine: files/chunks/embeddings in SQLite (WAL mode)
//! with dimension-partitioned embedding tables and in-process HNSW vector
//! indexes.
//!
//! Concurrency model: single writer, many readers. Read queries run on any
//! pooled connection; write operations serialize behind an internal lock
//! and never share a transaction with readers. External components access
//! rows exclusively through this engine's operations.
//!
//! ## Module structure
//!
//! - `helpers` — row types, errors, conversions, path-filter normalization
//! - `files` — file CRUD
//! - `chunks` — chunk CRUD and the atomic per-file replace
//! - `embeddings` — embedding CRUD across per-dims tables
//! - `search` — regex and semantic search

mod chunks;
pub(crate) mod embeddings;
mod files;
mod search;

pub mod helpers;

pub use helpers::{
    bytes_to_vector, cosine_similarity, normalize_path_filter, vector_to_bytes, ChunkRecord,
    EmbeddingRecord, FileRecord, HealthStatus, IndexStats, NewChunk, NewEmbedding, NewFile,
    Pagination, ProviderStats, SearchRow, StorageError, VectorIndexDescriptor,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Connection, Row, SqliteConnection, SqlitePool};

use crate::hnsw::{DistanceMetric, HnswVectorIndex, VectorIndexKey};
use helpers::{dims_from_table_name, embedding_table_name};

/// Checkpoint every N write operations...
const CHECKPOINT_OPS_THRESHOLD: u64 = 100;
/// ...or after this many seconds, whichever comes first.
const CHECKPOINT_INTERVAL_SECS: u64 = 300;

struct CheckpointState {
    ops_since_checkpoint: u64,
    last_checkpoint: Instant,
}

struct IndexEntry {
    key: VectorIndexKey,
    index: HnswVectorIndex,
}

/// The storage engine. One instance per process, owned by the server.
pub struct StorageEngine {
    pool: SqlitePool,
    db_path: PathBuf,
    /// Serializes write operations (single-writer model).
    write_lock: tokio::sync::Mutex<()>,
    checkpoint: Mutex<CheckpointState>,
    indexes: RwLock<HashMap<String, IndexEntry>>,
    connected: AtomicBool,
}

impl StorageEngine {
    /// Open (creating if missing) the database at `db_path`, running WAL
    /// corruption recovery if the first open fails with a corruption
    /// signature, then load schema and rebuild catalogued vector indexes.
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool = match Self::open_pool(db_path).await {
            Ok(pool) => pool,
            Err(e) if is_wal_corruption_error(&e.to_string()) => {
                tracing::warn!(error = %e, "WAL corruption detected on open");
                recover_wal(db_path).await?;
                Self::open_pool(db_path).await?
            }
            Err(e) => return Err(e.into()),
        };

        let engine = Self {
            pool,
            db_path: db_path.to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
            checkpoint: Mutex::new(CheckpointState {
                ops_since_checkpoint: 0,
                last_checkpoint: Instant::now(),
            }),
            indexes: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
        };

        engine.create_schema().await?;
        engine.migrate_legacy_embeddings_table().await?;
        engine.load_catalogued_indexes().await?;

        tracing::info!(path = %db_path.display(), "Storage engine connected");
        Ok(engine)
    }

    async fn open_pool(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            db_path.to_string_lossy().replace('\\', "/")
        ))?
        .create_if_missing(true);

        SqlitePoolOptions::new()
            .max_connections(4)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    // Foreign keys are off by default in SQLite.
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    // WAL: concurrent reads, single writer.
                    sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                    // NORMAL sync is safe with WAL and faster than FULL.
                    sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA temp_store = MEMORY").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
    }

    async fn create_schema(&self) -> Result<(), StorageError> {
        let schema = include_str!("schema.sql");
        for statement in schema.split(';') {
            let stmt: String = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Force a final checkpoint and close the pool. Idempotent.
    pub async fn disconnect(&self) -> Result<(), StorageError> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        // TRUNCATE integrates the WAL into the main file and deletes it.
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %e, "Checkpoint before disconnect failed");
        }
        self.pool.close().await;
        tracing::info!("Storage engine disconnected");
        Ok(())
    }

    /// Make recent writes immediately visible and durable (passive WAL
    /// checkpoint). Used by the watcher after each processed file.
    pub async fn flush(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record completed write operations and checkpoint when the cadence
    /// thresholds are reached.
    pub(crate) async fn record_writes(&self, count: u64) {
        let due = {
            let mut state = self.checkpoint.lock().unwrap_or_else(|e| e.into_inner());
            state.ops_since_checkpoint += count;
            state.ops_since_checkpoint >= CHECKPOINT_OPS_THRESHOLD
                || state.last_checkpoint.elapsed().as_secs() >= CHECKPOINT_INTERVAL_SECS
        };
        if due {
            self.checkpoint_now(false).await;
        }
    }

    pub(crate) async fn checkpoint_now(&self, force: bool) {
        let mode = if force { "TRUNCATE" } else { "PASSIVE" };
        match sqlx::query(&format!("PRAGMA wal_checkpoint({})", mode))
            .execute(&self.pool)
            .await
        {
            Ok(_) => {
                let mut state = self.checkpoint.lock().unwrap_or_else(|e| e.into_inner());
                state.ops_since_checkpoint = 0;
                state.last_checkpoint = Instant::now();
                tracing::debug!(mode, "Checkpoint completed");
            }
            Err(e) => tracing::warn!(error = %e, "Checkpoint failed"),
        }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) async fn write_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    // ===== Embedding tables =====

    pub(crate) async fn table_exists(&self, name: &str) -> Result<bool, StorageError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// All dimension-partitioned embedding tables present in the database.
    pub(crate) async fn all_embedding_tables(&self) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name LIKE 'embeddings\\_%' ESCAPE '\\'",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name,)| name)
            .filter(|name| dims_from_table_name(name).is_some())
            .collect())
    }

    /// Create the per-dims embedding table (and its secondary indexes) if
    /// missing. Returns the table name.
    pub async fn ensure_embedding_table(&self, dims: usize) -> Result<String, StorageError> {
        let table = embedding_table_name(dims);
        if self.table_exists(&table).await? {
            return Ok(table);
        }
        let mut conn = self.pool.acquire().await?;
        ensure_embedding_table_on(conn.as_mut(), dims).await?;
        tracing::info!(table = %table, dims, "Created embedding table");
        Ok(table)
    }

    // ===== Vector index lifecycle =====

    /// Build (or rebuild) the HNSW index for one provider/model/dims and
    /// record its descriptor in the catalog.
    pub async fn create_vector_index(
        &self,
        provider: &str,
        model: &str,
        dims: usize,
        metric: DistanceMetric,
    ) -> Result<String, StorageError> {
        self.ensure_embedding_table(dims).await?;
        let key = VectorIndexKey {
            provider: provider.to_string(),
            model: model.to_string(),
            dims,
            metric,
        };
        let name = key.index_name();

        let mut conn = self.pool.acquire().await?;
        let index = build_index_from_table(conn.as_mut(), &key).await?;

        sqlx::query(
            "INSERT OR REPLACE INTO vector_indexes (index_name, provider, model, dims, metric)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&name)
        .bind(provider)
        .bind(model)
        .bind(dims as i64)
        .bind(metric.to_string())
        .execute(&self.pool)
        .await?;

        let vectors = index.len();
        self.indexes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), IndexEntry { key, index });
        tracing::info!(index = %name, vectors, "Vector index created");
        Ok(name)
    }

    /// Drop the index graph and its catalog row. Returns the index name.
    pub async fn drop_vector_index(
        &self,
        provider: &str,
        model: &str,
        dims: usize,
        metric: DistanceMetric,
    ) -> Result<String, StorageError> {
        let key = VectorIndexKey {
            provider: provider.to_string(),
            model: model.to_string(),
            dims,
            metric,
        };
        let name = key.index_name();
        self.indexes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&name);
        sqlx::query("DELETE FROM vector_indexes WHERE index_name = ?1")
            .bind(&name)
            .execute(&self.pool)
            .await?;
        tracing::info!(index = %name, "Vector index dropped");
        Ok(name)
    }

    /// Catalogued vector indexes.
    pub async fn get_existing_vector_indexes(
        &self,
    ) -> Result<Vec<VectorIndexDescriptor>, StorageError> {
        let rows: Vec<(String, String, String, i64, String)> = sqlx::query_as(
            "SELECT index_name, provider, model, dims, metric FROM vector_indexes ORDER BY index_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(index_name, provider, model, dims, metric)| VectorIndexDescriptor {
                index_name,
                provider,
                model,
                dims: dims as usize,
                metric,
            })
            .collect())
    }

    /// Look up the in-memory index for a provider/model/dims, any metric.
    pub(crate) fn with_index<T>(
        &self,
        provider: &str,
        model: &str,
        dims: usize,
        f: impl FnOnce(&HnswVectorIndex) -> T,
    ) -> Option<T> {
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        indexes
            .values()
            .find(|entry| {
                entry.key.provider == provider
                    && entry.key.model == model
                    && entry.key.dims == dims
            })
            .map(|entry| f(&entry.index))
    }

    /// Push freshly inserted vectors into the matching in-memory index so
    /// realtime search sees them without a rebuild.
    pub(crate) fn extend_index(
        &self,
        provider: &str,
        model: &str,
        dims: usize,
        items: &[(i64, Vec<f32>)],
    ) {
        let mut indexes = self.indexes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = indexes.values_mut().find(|entry| {
            entry.key.provider == provider && entry.key.model == model && entry.key.dims == dims
        }) {
            if let Err(e) = entry.index.insert_batch(items) {
                tracing::warn!(error = %e, "Incremental index insert failed");
            }
        }
    }

    async fn load_catalogued_indexes(&self) -> Result<(), StorageError> {
        let descriptors = self.get_existing_vector_indexes().await?;
        for desc in descriptors {
            let Ok(metric) = desc.metric.parse::<DistanceMetric>() else {
                tracing::warn!(index = %desc.index_name, metric = %desc.metric, "Unknown metric in catalog, skipping");
                continue;
            };
            if !self.table_exists(&embedding_table_name(desc.dims)).await? {
                continue;
            }
            let key = VectorIndexKey {
                provider: desc.provider.clone(),
                model: desc.model.clone(),
                dims: desc.dims,
                metric,
            };
            let mut conn = self.pool.acquire().await?;
            match build_index_from_table(conn.as_mut(), &key).await {
                Ok(index) => {
                    tracing::info!(index = %desc.index_name, vectors = index.len(), "Vector index rebuilt");
                    self.indexes
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(desc.index_name.clone(), IndexEntry { key, index });
                }
                Err(e) => {
                    tracing::warn!(index = %desc.index_name, error = %e, "Vector index rebuild failed");
                }
            }
        }
        Ok(())
    }

    /// Run a bulk write with vector-index management: drop all index
    /// graphs, execute `op` inside a single transaction, rebuild indexes
    /// from the transaction's view, commit, then force a checkpoint. On
    /// failure: roll back, best-effort rebuild from committed state, and
    /// re-raise.
    pub async fn bulk_operation_with_index_management<T, F>(
        &self,
        op: F,
    ) -> Result<T, StorageError>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, StorageError>>,
    {
        let _write = self.write_guard().await;
        let existing = self.get_existing_vector_indexes().await?;

        // Drop the in-memory graphs up front; descriptors stay catalogued
        // and drive the rebuild.
        if !existing.is_empty() {
            tracing::info!(count = existing.len(), "Dropping vector indexes for bulk operation");
            let mut indexes = self.indexes.write().unwrap_or_else(|e| e.into_inner());
            for desc in &existing {
                indexes.remove(&desc.index_name);
            }
        }

        let mut tx = self.pool.begin().await?;
        let result = op(tx.as_mut()).await;

        match result {
            Ok(value) => {
                let mut rebuilt = Vec::new();
                for desc in &existing {
                    if let Ok(metric) = desc.metric.parse::<DistanceMetric>() {
                        let key = VectorIndexKey {
                            provider: desc.provider.clone(),
                            model: desc.model.clone(),
                            dims: desc.dims,
                            metric,
                        };
                        match build_index_from_table(tx.as_mut(), &key).await {
                            Ok(index) => rebuilt.push((desc.index_name.clone(), key, index)),
                            Err(e) => {
                                tracing::warn!(index = %desc.index_name, error = %e, "Index rebuild after bulk op failed");
                            }
                        }
                    }
                }
                tx.commit().await?;

                {
                    let mut indexes = self.indexes.write().unwrap_or_else(|e| e.into_inner());
                    for (name, key, index) in rebuilt {
                        indexes.insert(name, IndexEntry { key, index });
                    }
                }

                self.checkpoint_now(true).await;
                tracing::info!("Bulk operation completed with index management");
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback after bulk failure also failed");
                }
                // Best-effort rebuild from committed state.
                for desc in &existing {
                    if let Ok(metric) = desc.metric.parse::<DistanceMetric>() {
                        let key = VectorIndexKey {
                            provider: desc.provider.clone(),
                            model: desc.model.clone(),
                            dims: desc.dims,
                            metric,
                        };
                        let mut conn = match self.pool.acquire().await {
                            Ok(c) => c,
                            Err(_) => break,
                        };
                        if let Ok(index) = build_index_from_table(conn.as_mut(), &key).await {
                            self.indexes
                                .write()
                                .unwrap_or_else(|e| e.into_inner())
                                .insert(desc.index_name.clone(), IndexEntry { key, index });
                        }
                    }
                }
                tracing::error!(error = %e, "Bulk operation failed, rolled back");
                Err(e)
            }
        }
    }

    // ===== Stats & health =====

    /// Aggregate counts across files, chunks, and every embedding table.
    pub async fn get_stats(&self) -> Result<IndexStats, StorageError> {
        let (files,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let (chunks,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;

        let mut embeddings = 0u64;
        let mut providers: std::collections::HashSet<(String, String)> =
            std::collections::HashSet::new();
        for table in self.all_embedding_tables().await? {
            let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&self.pool)
                .await?;
            embeddings += count as u64;

            let pairs: Vec<(String, String)> = sqlx::query_as(&format!(
                "SELECT DISTINCT provider, model FROM {}",
                table
            ))
            .fetch_all(&self.pool)
            .await?;
            providers.extend(pairs);
        }

        Ok(IndexStats {
            files: files as u64,
            chunks: chunks as u64,
            embeddings,
            providers: providers.len() as u64,
        })
    }

    /// Embedding statistics for one provider/model pair.
    pub async fn get_provider_stats(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<ProviderStats, StorageError> {
        let mut embeddings = 0u64;
        let mut files: std::collections::HashSet<i64> = std::collections::HashSet::new();
        let mut dims = 0u64;

        for table in self.all_embedding_tables().await? {
            let (count,): (i64,) = sqlx::query_as(&format!(
                "SELECT COUNT(*) FROM {} WHERE provider = ?1 AND model = ?2",
                table
            ))
            .bind(provider)
            .bind(model)
            .fetch_one(&self.pool)
            .await?;
            embeddings += count as u64;

            if count > 0 {
                let file_ids: Vec<(i64,)> = sqlx::query_as(&format!(
                    "SELECT DISTINCT c.file_id FROM {} e JOIN chunks c ON e.chunk_id = c.id
                     WHERE e.provider = ?1 AND e.model = ?2",
                    table
                ))
                .bind(provider)
                .bind(model)
                .fetch_all(&self.pool)
                .await?;
                files.extend(file_ids.into_iter().map(|(id,)| id));

                if dims == 0 {
                    dims = dims_from_table_name(&table).unwrap_or(0) as u64;
                }
            }
        }

        Ok(ProviderStats {
            provider: provider.to_string(),
            model: model.to_string(),
            embeddings,
            files: files.len() as u64,
            dimensions: dims,
        })
    }

    /// Best-effort health snapshot; individual check failures land in
    /// `errors` instead of failing the call.
    pub async fn health_check(&self) -> HealthStatus {
        let mut status = HealthStatus {
            provider: "sqlite",
            connected: self.is_connected(),
            db_path: self.db_path.display().to_string(),
            tables: Vec::new(),
            errors: Vec::new(),
        };
        if !status.connected {
            status.errors.push("not connected".into());
            return status;
        }

        match sqlx::query_as::<_, (String,)>(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => status.tables = rows.into_iter().map(|(n,)| n).collect(),
            Err(e) => status.errors.push(format!("table listing failed: {}", e)),
        }

        if let Err(e) = sqlx::query("SELECT 1").execute(&self.pool).await {
            status.errors.push(format!("basic query failed: {}", e));
        }
        status
    }
}

/// Create the per-dims table and its secondary indexes on an arbitrary
/// executor (pool connection or open transaction).
pub(crate) async fn ensure_embedding_table_on(
    conn: &mut SqliteConnection,
    dims: usize,
) -> Result<String, StorageError> {
    let table = embedding_table_name(dims);
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_id INTEGER NOT NULL REFERENCES chunks(id),
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL DEFAULT {dims},
            created_at TEXT NOT NULL,
            UNIQUE (chunk_id, provider, model)
        )"
    ))
    .execute(&mut *conn)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_emb_{dims}_chunk_id ON {table}(chunk_id)"
    ))
    .execute(&mut *conn)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_emb_{dims}_provider_model ON {table}(provider, model)"
    ))
    .execute(&mut *conn)
    .await?;
    Ok(table)
}

/// Build an HNSW index from a table's rows for one provider/model.
async fn build_index_from_table(
    conn: &mut SqliteConnection,
    key: &VectorIndexKey,
) -> Result<HnswVectorIndex, StorageError> {
    let table = embedding_table_name(key.dims);
    let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(&format!(
        "SELECT chunk_id, embedding FROM {} WHERE provider = ?1 AND model = ?2",
        table
    ))
    .bind(&key.provider)
    .bind(&key.model)
    .fetch_all(&mut *conn)
    .await?;

    let items: Vec<(i64, Vec<f32>)> = rows
        .into_iter()
        .map(|(id, bytes)| (id, bytes_to_vector(&bytes)))
        .filter(|(_, v)| v.len() == key.dims)
        .collect();

    Ok(HnswVectorIndex::build(key.dims, key.metric, &items)?)
}

impl StorageEngine {
    /// Split a pre-partitioning `embeddings` table into per-dims tables.
    async fn migrate_legacy_embeddings_table(&self) -> Result<(), StorageError> {
        if !self.table_exists("embeddings").await? {
            return Ok(());
        }
        tracing::info!("Migrating legacy embeddings table to dimension-specific tables");

        let rows = sqlx::query(
            "SELECT chunk_id, provider, model, embedding, created_at FROM embeddings",
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            sqlx::query("DROP TABLE embeddings").execute(&self.pool).await?;
            return Ok(());
        }

        let mut by_dims: HashMap<usize, Vec<(i64, String, String, Vec<u8>, String)>> =
            HashMap::new();
        for row in rows {
            let bytes: Vec<u8> = row.get(3);
            let dims = bytes.len() / 4;
            by_dims.entry(dims).or_default().push((
                row.get(0),
                row.get(1),
                row.get(2),
                bytes,
                row.get(4),
            ));
        }

        let mut tx = self.pool.begin().await?;
        for (dims, entries) in by_dims {
            let table = ensure_embedding_table_on(tx.as_mut(), dims).await?;
            for (chunk_id, provider, model, bytes, created_at) in entries {
                sqlx::query(&format!(
                    "INSERT OR IGNORE INTO {} (chunk_id, provider, model, embedding, dims, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    table
                ))
                .bind(chunk_id)
                .bind(provider)
                .bind(model)
                .bind(bytes)
                .bind(dims as i64)
                .bind(created_at)
                .execute(tx.as_mut())
                .await?;
            }
        }
        sqlx::query("DROP TABLE embeddings").execute(tx.as_mut()).await?;
        tx.commit().await?;
        tracing::info!("Legacy embeddings migration complete");
        Ok(())
    }
}

/// Corruption signatures seen when the WAL references state the engine
/// cannot replay.
fn is_wal_corruption_error(message: &str) -> bool {
    const INDICATORS: &[&str] = &[
        "database disk image is malformed",
        "file is not a database",
        "malformed database schema",
        "wal",
    ];
    let lower = message.to_lowercase();
    INDICATORS.iter().any(|i| lower.contains(i))
}

/// Two-step WAL recovery: first try to integrate the WAL on a scratch
/// connection with a forced checkpoint; if that fails, back the WAL up as
/// `<db>.wal.corrupt` and remove it so a clean open can proceed.
async fn recover_wal(db_path: &Path) -> Result<(), StorageError> {
    let wal_path = PathBuf::from(format!("{}-wal", db_path.display()));
    if !wal_path.exists() {
        tracing::warn!("WAL corruption reported but no WAL file present");
        return Ok(());
    }

    let scratch = async {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            db_path.to_string_lossy().replace('\\', "/")
        ))?;
        let mut conn = SqliteConnection::connect_with(&options).await?;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        Ok::<(), sqlx::Error>(())
    }
    .await;

    match scratch {
        Ok(()) => {
            tracing::info!("WAL recovered via scratch checkpoint");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Scratch recovery failed, backing up WAL");
            let backup = PathBuf::from(format!("{}.wal.corrupt", db_path.display()));
            std::fs::copy(&wal_path, &backup)
                .map_err(|e| StorageError::WalRecovery(format!("backup failed: {}", e)))?;
            std::fs::remove_file(&wal_path)
                .map_err(|e| StorageError::WalRecovery(format!("removal failed: {}", e)))?;
            let shm_path = PathBuf::from(format!("{}-shm", db_path.display()));
            let _ = std::fs::remove_file(shm_path);
            tracing::warn!(backup = %backup.display(), "Corrupted WAL backed up and removed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_corruption_detection() {
        assert!(is_wal_corruption_error("database disk image is malformed"));
        assert!(is_wal_corruption_error("error: File is not a database"));
        assert!(!is_wal_corruption_error("no such table: files"));
    }

    #[tokio::test]
    async fn test_connect_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::connect(&dir.path().join("db")).await.unwrap();
        let health = engine.health_check().await;
        assert!(health.connected);
        assert!(health.tables.iter().any(|t| t == "files"));
        assert!(health.tables.iter().any(|t| t == "chunks"));
        assert!(health.tables.iter().any(|t| t == "vector_indexes"));
        assert!(health.errors.is_empty());
        engine.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::connect(&dir.path().join("db")).await.unwrap();
        engine.disconnect().await.unwrap();
        engine.disconnect().await.unwrap();
        assert!(!engine.is_connected());
    }

    #[tokio::test]
    async fn test_ensure_embedding_table_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::connect(&dir.path().join("db")).await.unwrap();
        assert!(engine.all_embedding_tables().await.unwrap().is_empty());

        let table = engine.ensure_embedding_table(384).await.unwrap();
        assert_eq!(table, "embeddings_384");
        assert!(engine.table_exists("embeddings_384").await.unwrap());
        assert_eq!(
            engine.all_embedding_tables().await.unwrap(),
            vec!["embeddings_384".to_string()]
        );
        engine.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_vector_index_catalog_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::connect(&dir.path().join("db")).await.unwrap();

        let name = engine
            .create_vector_index("openai", "text-embedding-3-small", 8, DistanceMetric::Cosine)
            .await
            .unwrap();
        let descriptors = engine.get_existing_vector_indexes().await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].index_name, name);
        assert_eq!(descriptors[0].dims, 8);
        assert_eq!(descriptors[0].metric, "cosine");

        engine
            .drop_vector_index("openai", "text-embedding-3-small", 8, DistanceMetric::Cosine)
            .await
            .unwrap();
        assert!(engine.get_existing_vector_indexes().await.unwrap().is_empty());
        engine.disconnect().await.unwrap();
    }
}
