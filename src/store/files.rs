//! File CRUD.

use sqlx::Row;

use super::helpers::{FileRecord, NewFile, StorageError};
use super::StorageEngine;
use crate::parser::Language;

const FILE_COLUMNS: &str =
    "id, path, name, extension, size, modified_time, language, checksum, created_at, updated_at";

fn decode_file(row: &sqlx::sqlite::SqliteRow) -> FileRecord {
    let language: String = row.get(6);
    FileRecord {
        id: row.get(0),
        path: row.get(1),
        name: row.get(2),
        extension: row.get(3),
        size: row.get(4),
        modified_time: row.get(5),
        language: language.parse().unwrap_or(Language::Unknown),
        checksum: row.get(7),
        created_at: row.get(8),
        updated_at: row.get(9),
    }
}

impl StorageEngine {
    /// Insert or update a file row, keyed by path. Returns the file id.
    pub async fn insert_file(&self, file: &NewFile) -> Result<i64, StorageError> {
        let _write = self.write_guard().await;
        let now = chrono::Utc::now().to_rfc3339();
        let row = sqlx::query(
            "INSERT INTO files (path, name, extension, size, modified_time, language, checksum, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(path) DO UPDATE SET
                 name = excluded.name,
                 extension = excluded.extension,
                 size = excluded.size,
                 modified_time = excluded.modified_time,
                 language = excluded.language,
                 checksum = excluded.checksum,
                 updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(&file.path)
        .bind(&file.name)
        .bind(&file.extension)
        .bind(file.size)
        .bind(file.modified_time)
        .bind(file.language.to_string())
        .bind(&file.checksum)
        .bind(&now)
        .fetch_one(self.pool())
        .await?;
        self.record_writes(1).await;
        Ok(row.get(0))
    }

    pub async fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM files WHERE path = ?1",
            FILE_COLUMNS
        ))
        .bind(path)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(decode_file))
    }

    pub async fn get_file_by_id(&self, file_id: i64) -> Result<Option<FileRecord>, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS))
            .bind(file_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(decode_file))
    }

    /// Update size/mtime/checksum on an existing file row.
    pub async fn update_file(
        &self,
        file_id: i64,
        size: Option<i64>,
        mtime: Option<f64>,
        checksum: Option<&str>,
    ) -> Result<(), StorageError> {
        let _write = self.write_guard().await;
        let mut sets = vec!["updated_at = ?1".to_string()];
        if size.is_some() {
            sets.push("size = ?2".into());
        }
        if mtime.is_some() {
            sets.push("modified_time = ?3".into());
        }
        if checksum.is_some() {
            sets.push("checksum = ?4".into());
        }
        let query = format!("UPDATE files SET {} WHERE id = ?5", sets.join(", "));
        sqlx::query(&query)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(size)
            .bind(mtime)
            .bind(checksum)
            .bind(file_id)
            .execute(self.pool())
            .await?;
        self.record_writes(1).await;
        Ok(())
    }

    /// Every indexed file path (used for orphan cleanup).
    pub async fn get_all_file_paths(&self) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT path FROM files ORDER BY path")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    /// Delete a file and everything hanging off it: embeddings first (by
    /// explicit chunk-id list), then chunks, then the file row. Returns
    /// false when the path is not indexed.
    pub async fn delete_file_completely(&self, path: &str) -> Result<bool, StorageError> {
        let Some(file) = self.get_file_by_path(path).await? else {
            return Ok(false);
        };

        let embedding_tables = self.all_embedding_tables().await?;
        let _write = self.write_guard().await;
        let mut tx = self.pool().begin().await?;

        let chunk_ids: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM chunks WHERE file_id = ?1")
                .bind(file.id)
                .fetch_all(tx.as_mut())
                .await?;
        let chunk_ids: Vec<i64> = chunk_ids.into_iter().map(|(id,)| id).collect();

        if !chunk_ids.is_empty() {
            let placeholders = vec!["?"; chunk_ids.len()].join(",");
            for table in &embedding_tables {
                let query = format!(
                    "DELETE FROM {} WHERE chunk_id IN ({})",
                    table, placeholders
                );
                let mut q = sqlx::query(&query);
                for id in &chunk_ids {
                    q = q.bind(id);
                }
                q.execute(tx.as_mut()).await?;
            }

            let query = format!("DELETE FROM chunks WHERE id IN ({})", placeholders);
            let mut q = sqlx::query(&query);
            for id in &chunk_ids {
                q = q.bind(id);
            }
            q.execute(tx.as_mut()).await?;
        }

        sqlx::query("DELETE FROM files WHERE id = ?1")
            .bind(file.id)
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;

        self.record_writes(1 + chunk_ids.len() as u64).await;
        tracing::debug!(path = %path, chunks = chunk_ids.len(), "File deleted completely");
        Ok(true)
    }
}
