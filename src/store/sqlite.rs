//! SQLite-backed [`VectorIndex`].
//!
//! Every collection lives in one `vectors` table keyed by
//! `(collection, id)`; embeddings are little-endian f32 BLOBs. The database
//! file, tables and collection row are created when the index is opened.
//! Each `upsert` call is one transaction.
//!
//! Files with identical content share vector ids, so `vector_owners` lists
//! every path behind a record. `vectors.path` names one of them. A record is
//! deleted only when its last owner releases it.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::{matches_filter, rank, MetadataFilter, VectorIndex, VectorMatch};
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{VectorMetadata, VectorRecord};

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    collection: String,
}

impl SqliteVectorIndex {
    /// Opens the index file at `path`, creating it and `collection` if needed.
    pub async fn open(path: &Path, collection: &str) -> Result<Self> {
        let pool = db::connect(path).await?;
        Self::with_pool(pool, collection).await
    }

    pub async fn with_pool(pool: SqlitePool, collection: &str) -> Result<Self> {
        create_schema(&pool).await?;
        sqlx::query("INSERT OR IGNORE INTO collections (name) VALUES (?)")
            .bind(collection)
            .execute(&pool)
            .await?;
        Ok(Self {
            pool,
            collection: collection.to_string(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Drops `path` as an owner of every id not in `keep_ids`. Records left
    /// without owners are deleted; the rest are re-pointed at a remaining
    /// owner. Returns the number of records deleted.
    async fn release(&self, path: &str, keep_ids: &[String]) -> Result<usize> {
        let keep_json = serde_json::to_string(keep_ids)?;
        let mut tx = self.pool.begin().await?;
        let released: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM vector_owners
            WHERE collection = ? AND path = ?
              AND id NOT IN (SELECT value FROM json_each(?))
            RETURNING id
            "#,
        )
        .bind(&self.collection)
        .bind(path)
        .bind(&keep_json)
        .fetch_all(&mut *tx)
        .await?;

        let mut removed = 0;
        for id in &released {
            let successor: Option<(String, String)> = sqlx::query_as(
                "SELECT path, metadata_json FROM vector_owners WHERE collection = ? AND id = ? ORDER BY path LIMIT 1",
            )
            .bind(&self.collection)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            match successor {
                Some((owner, metadata_json)) => {
                    sqlx::query(
                        "UPDATE vectors SET path = ?, metadata_json = ? WHERE collection = ? AND id = ? AND path = ?",
                    )
                    .bind(&owner)
                    .bind(&metadata_json)
                    .bind(&self.collection)
                    .bind(id)
                    .bind(path)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    removed += sqlx::query("DELETE FROM vectors WHERE collection = ? AND id = ?")
                        .bind(&self.collection)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected() as usize;
                }
            }
        }
        tx.commit().await?;
        Ok(removed)
    }
}

async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            path TEXT NOT NULL,
            document TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_path ON vectors(collection, path)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_owners (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            path TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            PRIMARY KEY (collection, id, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vector_owners_path ON vector_owners(collection, path)",
    )
    .execute(pool)
    .await?;

    // Records written before owners were tracked belong to their path.
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO vector_owners (collection, id, path, metadata_json)
        SELECT v.collection, v.id, v.path, v.metadata_json FROM vectors v
        WHERE NOT EXISTS (
            SELECT 1 FROM vector_owners o WHERE o.collection = v.collection AND o.id = v.id
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            let metadata_json = serde_json::to_string(&record.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO vectors (collection, id, path, document, metadata_json, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    path = excluded.path,
                    document = excluded.document,
                    metadata_json = excluded.metadata_json,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&self.collection)
            .bind(&record.id)
            .bind(&record.metadata.path)
            .bind(&record.document)
            .bind(&metadata_json)
            .bind(record.embedding.len() as i64)
            .bind(vec_to_blob(&record.embedding))
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO vector_owners (collection, id, path, metadata_json)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(collection, id, path) DO UPDATE SET
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(&self.collection)
            .bind(&record.id)
            .bind(&record.metadata.path)
            .bind(&metadata_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let rows = sqlx::query(
            "SELECT id, document, metadata_json, embedding FROM vectors WHERE collection = ?",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let metadata_json: String = row.get("metadata_json");
            let metadata: VectorMetadata = serde_json::from_str(&metadata_json)
                .with_context(|| format!("corrupt metadata for vector {}", id))?;
            if let Some(f) = filter {
                if !matches_filter(&metadata, f) {
                    continue;
                }
            }
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(embedding, &blob_to_vec(&blob)) as f64;
            matches.push(VectorMatch {
                id,
                document: row.get("document"),
                metadata,
                score,
                distance: 1.0 - score,
            });
        }

        Ok(rank(matches, k))
    }

    async fn retain_for_path(&self, path: &str, keep_ids: &[String]) -> Result<usize> {
        self.release(path, keep_ids).await
    }

    async fn delete_path(&self, path: &str) -> Result<usize> {
        self.release(path, &[]).await
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}
