//! Embedding CRUD across the dimension-partitioned tables.

use std::collections::{HashMap, HashSet};

use sqlx::SqliteConnection;

use super::helpers::{
    bytes_to_vector, vector_to_bytes, EmbeddingRecord, NewEmbedding, StorageError,
};
use super::{ensure_embedding_table_on, StorageEngine};

/// Default rows per multi-row INSERT when the caller does not specify one.
const DEFAULT_INSERT_BATCH: usize = 500;

/// Upsert embeddings grouped by dims onto an arbitrary executor. The
/// UNIQUE(chunk_id, provider, model) constraint makes re-embedding an
/// overwrite rather than a duplicate.
pub(crate) async fn insert_embeddings_on(
    conn: &mut SqliteConnection,
    embeddings: &[NewEmbedding],
    batch_size: usize,
) -> Result<usize, StorageError> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut by_dims: HashMap<usize, Vec<&NewEmbedding>> = HashMap::new();
    for e in embeddings {
        by_dims.entry(e.vector.len()).or_default().push(e);
    }

    let mut inserted = 0usize;
    for (dims, group) in by_dims {
        let table = ensure_embedding_table_on(&mut *conn, dims).await?;
        for batch in group.chunks(batch_size.max(1)) {
            let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(format!(
                "INSERT INTO {} (chunk_id, provider, model, embedding, dims, created_at) ",
                table
            ));
            builder.push_values(batch, |mut b, e| {
                b.push_bind(e.chunk_id)
                    .push_bind(e.provider.clone())
                    .push_bind(e.model.clone())
                    .push_bind(vector_to_bytes(&e.vector))
                    .push_bind(dims as i64)
                    .push_bind(now.clone());
            });
            builder.push(
                " ON CONFLICT(chunk_id, provider, model) DO UPDATE SET \
                 embedding = excluded.embedding, dims = excluded.dims, \
                 created_at = excluded.created_at",
            );
            builder.build().execute(&mut *conn).await?;
            inserted += batch.len();
        }
    }
    Ok(inserted)
}

impl StorageEngine {
    pub async fn insert_embedding(&self, embedding: &NewEmbedding) -> Result<(), StorageError> {
        self.insert_embeddings_batch(std::slice::from_ref(embedding), None)
            .await?;
        Ok(())
    }

    /// Upsert a batch of embeddings (possibly spanning several dims) in one
    /// transaction, then feed the vectors to the matching in-memory index.
    pub async fn insert_embeddings_batch(
        &self,
        embeddings: &[NewEmbedding],
        batch_size: Option<usize>,
    ) -> Result<usize, StorageError> {
        if embeddings.is_empty() {
            return Ok(0);
        }
        let batch_size = batch_size.unwrap_or(DEFAULT_INSERT_BATCH);

        let inserted = {
            let _write = self.write_guard().await;
            let mut tx = self.pool().begin().await?;
            let inserted = insert_embeddings_on(tx.as_mut(), embeddings, batch_size).await?;
            tx.commit().await?;
            inserted
        };
        self.record_writes(inserted as u64).await;

        // Keep live indexes fresh for the watcher path.
        let mut by_key: HashMap<(String, String, usize), Vec<(i64, Vec<f32>)>> = HashMap::new();
        for e in embeddings {
            by_key
                .entry((e.provider.clone(), e.model.clone(), e.vector.len()))
                .or_default()
                .push((e.chunk_id, e.vector.clone()));
        }
        for ((provider, model, dims), items) in by_key {
            self.extend_index(&provider, &model, dims, &items);
        }

        Ok(inserted)
    }

    /// Fetch one embedding row for a chunk/provider/model, if present.
    pub async fn get_embedding_by_chunk_id(
        &self,
        chunk_id: i64,
        provider: &str,
        model: &str,
    ) -> Result<Option<EmbeddingRecord>, StorageError> {
        for table in self.all_embedding_tables().await? {
            let row: Option<(i64, i64, String, String, Vec<u8>, i64, String)> =
                sqlx::query_as(&format!(
                    "SELECT id, chunk_id, provider, model, embedding, dims, created_at
                     FROM {} WHERE chunk_id = ?1 AND provider = ?2 AND model = ?3",
                    table
                ))
                .bind(chunk_id)
                .bind(provider)
                .bind(model)
                .fetch_optional(self.pool())
                .await?;
            if let Some((id, chunk_id, provider, model, bytes, dims, created_at)) = row {
                return Ok(Some(EmbeddingRecord {
                    id,
                    chunk_id,
                    provider,
                    model,
                    vector: bytes_to_vector(&bytes),
                    dims,
                    created_at,
                }));
            }
        }
        Ok(None)
    }

    /// The subset of `chunk_ids` that already have an embedding for this
    /// provider/model. The embedding service subtracts this before calling
    /// the provider.
    pub async fn get_existing_embeddings(
        &self,
        chunk_ids: &[i64],
        provider: &str,
        model: &str,
    ) -> Result<HashSet<i64>, StorageError> {
        if chunk_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut existing = HashSet::new();
        let placeholders = vec!["?"; chunk_ids.len()].join(",");
        for table in self.all_embedding_tables().await? {
            let query = format!(
                "SELECT chunk_id FROM {} WHERE provider = ?1 AND model = ?2 AND chunk_id IN ({})",
                table, placeholders
            );
            let mut q = sqlx::query_as::<_, (i64,)>(&query).bind(provider).bind(model);
            for id in chunk_ids {
                q = q.bind(id);
            }
            existing.extend(q.fetch_all(self.pool()).await?.into_iter().map(|(id,)| id));
        }
        Ok(existing)
    }

    /// Remove every embedding of a chunk across all per-dims tables.
    pub async fn delete_embeddings_by_chunk_id(
        &self,
        chunk_id: i64,
    ) -> Result<usize, StorageError> {
        let tables = self.all_embedding_tables().await?;
        let _write = self.write_guard().await;
        let mut deleted = 0usize;
        for table in tables {
            let result = sqlx::query(&format!("DELETE FROM {} WHERE chunk_id = ?1", table))
                .bind(chunk_id)
                .execute(self.pool())
                .await?;
            deleted += result.rows_affected() as usize;
        }
        self.record_writes(deleted as u64).await;
        Ok(deleted)
    }

}
