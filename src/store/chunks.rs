//! Chunk CRUD and the atomic per-file replace used by the indexing
//! coordinator.

use sqlx::{Row, SqliteConnection};

use super::helpers::{ChunkRecord, NewChunk, StorageError};
use super::StorageEngine;
use crate::parser::{ChunkType, Language};

const CHUNK_COLUMNS: &str = "id, file_id, chunk_type, symbol, code, start_line, end_line, \
                             start_byte, end_byte, size, signature, language";

/// Rows per multi-row INSERT. 12 columns per row keeps this comfortably
/// under SQLite's bound-parameter limit.
const INSERT_ROWS_PER_STATEMENT: usize = 500;

fn decode_chunk(row: &sqlx::sqlite::SqliteRow) -> ChunkRecord {
    let chunk_type: String = row.get(2);
    let language: String = row.get(11);
    ChunkRecord {
        id: row.get(0),
        file_id: row.get(1),
        chunk_type: chunk_type.parse().unwrap_or(ChunkType::Unknown),
        symbol: row.get(3),
        code: row.get(4),
        start_line: row.get(5),
        end_line: row.get(6),
        start_byte: row.get(7),
        end_byte: row.get(8),
        size: row.get(9),
        signature: row.get(10),
        language: language.parse().unwrap_or(Language::Unknown),
    }
}

/// Multi-row insert returning ids in input order.
pub(crate) async fn insert_chunks_on(
    conn: &mut SqliteConnection,
    chunks: &[NewChunk],
) -> Result<Vec<i64>, StorageError> {
    let mut ids = Vec::with_capacity(chunks.len());
    let now = chrono::Utc::now().to_rfc3339();

    for batch in chunks.chunks(INSERT_ROWS_PER_STATEMENT) {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "INSERT INTO chunks (file_id, chunk_type, symbol, code, start_line, end_line, \
             start_byte, end_byte, size, signature, language, created_at, updated_at) ",
        );
        builder.push_values(batch, |mut b, chunk| {
            b.push_bind(chunk.file_id)
                .push_bind(chunk.chunk_type.to_string())
                .push_bind(chunk.symbol.clone())
                .push_bind(chunk.code.clone())
                .push_bind(chunk.start_line)
                .push_bind(chunk.end_line)
                .push_bind(chunk.start_byte)
                .push_bind(chunk.end_byte)
                .push_bind(chunk.code.len() as i64)
                .push_bind(chunk.signature.clone())
                .push_bind(chunk.language.to_string())
                .push_bind(now.clone())
                .push_bind(now.clone());
        });
        builder.push(" RETURNING id");

        let rows = builder.build().fetch_all(&mut *conn).await?;
        ids.extend(rows.into_iter().map(|row| row.get::<i64, _>(0)));
    }
    Ok(ids)
}

/// Delete chunks (and their embeddings across every per-dims table) by
/// explicit id list — never by subquery, so completeness is guaranteed
/// even if the chunk set changes concurrently.
pub(crate) async fn delete_chunks_on(
    conn: &mut SqliteConnection,
    embedding_tables: &[String],
    chunk_ids: &[i64],
) -> Result<(), StorageError> {
    if chunk_ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; chunk_ids.len()].join(",");
    for table in embedding_tables {
        let query = format!("DELETE FROM {} WHERE chunk_id IN ({})", table, placeholders);
        let mut q = sqlx::query(&query);
        for id in chunk_ids {
            q = q.bind(id);
        }
        q.execute(&mut *conn).await?;
    }
    let query = format!("DELETE FROM chunks WHERE id IN ({})", placeholders);
    let mut q = sqlx::query(&query);
    for id in chunk_ids {
        q = q.bind(id);
    }
    q.execute(&mut *conn).await?;
    Ok(())
}

impl StorageEngine {
    pub async fn insert_chunk(&self, chunk: &NewChunk) -> Result<i64, StorageError> {
        let ids = self.insert_chunks_batch(std::slice::from_ref(chunk)).await?;
        Ok(ids[0])
    }

    /// Insert chunks in one transaction; ids come back in input order.
    pub async fn insert_chunks_batch(
        &self,
        chunks: &[NewChunk],
    ) -> Result<Vec<i64>, StorageError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let _write = self.write_guard().await;
        let mut tx = self.pool().begin().await?;
        let ids = insert_chunks_on(tx.as_mut(), chunks).await?;
        tx.commit().await?;
        self.record_writes(chunks.len() as u64).await;
        Ok(ids)
    }

    pub async fn get_chunk_by_id(
        &self,
        chunk_id: i64,
    ) -> Result<Option<ChunkRecord>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE id = ?1",
            CHUNK_COLUMNS
        ))
        .bind(chunk_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(decode_chunk))
    }

    /// All chunks for a file, ordered by start line.
    pub async fn get_chunks_by_file_id(
        &self,
        file_id: i64,
    ) -> Result<Vec<ChunkRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE file_id = ?1 ORDER BY start_line",
            CHUNK_COLUMNS
        ))
        .bind(file_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(decode_chunk).collect())
    }

    /// `(id, code)` pairs for a set of chunks — the embedding service's
    /// input fetch.
    pub async fn get_chunk_codes(
        &self,
        chunk_ids: &[i64],
    ) -> Result<Vec<(i64, String)>, StorageError> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; chunk_ids.len()].join(",");
        let query = format!("SELECT id, code FROM chunks WHERE id IN ({})", placeholders);
        let mut q = sqlx::query_as::<_, (i64, String)>(&query);
        for id in chunk_ids {
            q = q.bind(id);
        }
        Ok(q.fetch_all(self.pool()).await?)
    }

    /// Delete every chunk of a file, cascading to embeddings first.
    pub async fn delete_file_chunks(&self, file_id: i64) -> Result<usize, StorageError> {
        let embedding_tables = self.all_embedding_tables().await?;
        let _write = self.write_guard().await;
        let mut tx = self.pool().begin().await?;

        let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM chunks WHERE file_id = ?1")
            .bind(file_id)
            .fetch_all(tx.as_mut())
            .await?;
        let ids: Vec<i64> = ids.into_iter().map(|(id,)| id).collect();

        delete_chunks_on(tx.as_mut(), &embedding_tables, &ids).await?;
        tx.commit().await?;
        self.record_writes(ids.len() as u64).await;
        Ok(ids.len())
    }

    pub async fn delete_chunk(&self, chunk_id: i64) -> Result<(), StorageError> {
        let embedding_tables = self.all_embedding_tables().await?;
        let _write = self.write_guard().await;
        let mut tx = self.pool().begin().await?;
        delete_chunks_on(tx.as_mut(), &embedding_tables, &[chunk_id]).await?;
        tx.commit().await?;
        self.record_writes(1).await;
        Ok(())
    }

    /// Update mutable chunk fields. `None` leaves a field untouched.
    pub async fn update_chunk(
        &self,
        chunk_id: i64,
        code: Option<&str>,
        symbol: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), StorageError> {
        let _write = self.write_guard().await;
        let mut sets = vec!["updated_at = ?1".to_string()];
        if code.is_some() {
            sets.push("code = ?2".into());
            sets.push("size = ?3".into());
        }
        if symbol.is_some() {
            sets.push("symbol = ?4".into());
        }
        if signature.is_some() {
            sets.push("signature = ?5".into());
        }
        let query = format!("UPDATE chunks SET {} WHERE id = ?6", sets.join(", "));
        sqlx::query(&query)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(code)
            .bind(code.map(|c| c.len() as i64))
            .bind(symbol)
            .bind(signature)
            .bind(chunk_id)
            .execute(self.pool())
            .await?;
        self.record_writes(1).await;
        Ok(())
    }

    /// Atomic per-file update: delete superseded chunks (with their
    /// embeddings), insert replacements, and refresh the file row — all in
    /// one transaction, so readers never observe a partial chunk set.
    /// Returns the inserted chunk ids in input order.
    #[allow(clippy::too_many_arguments)]
    pub async fn replace_file_chunks(
        &self,
        file_id: i64,
        delete_ids: &[i64],
        new_chunks: &[NewChunk],
        size: i64,
        mtime: f64,
        checksum: Option<&str>,
    ) -> Result<Vec<i64>, StorageError> {
        let embedding_tables = self.all_embedding_tables().await?;
        let _write = self.write_guard().await;
        let mut tx = self.pool().begin().await?;

        delete_chunks_on(tx.as_mut(), &embedding_tables, delete_ids).await?;
        let inserted = insert_chunks_on(tx.as_mut(), new_chunks).await?;

        sqlx::query(
            "UPDATE files SET size = ?1, modified_time = ?2, checksum = ?3, updated_at = ?4
             WHERE id = ?5",
        )
        .bind(size)
        .bind(mtime)
        .bind(checksum)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(file_id)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;
        self.record_writes(1 + delete_ids.len() as u64 + new_chunks.len() as u64)
            .await;
        Ok(inserted)
    }
}
