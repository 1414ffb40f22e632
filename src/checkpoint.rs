//! Durable per-run checkpoints.
//!
//! A checkpoint records the last completed stage of a run together with the
//! run state serialized as JSON. The table is keyed by run id, so saving
//! again overwrites the previous checkpoint of that run.

use std::path::Path;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::db;
use crate::error::PipelineError;
use crate::pipeline::Stage;

/// Summary of a stored checkpoint, without its state payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointInfo {
    pub run_id: String,
    pub pipeline: String,
    pub stage: Stage,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_checkpoints (
                run_id TEXT PRIMARY KEY,
                pipeline TEXT NOT NULL,
                stage TEXT NOT NULL,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Records `stage` as the last completed stage of `run_id`.
    pub async fn save<T: Serialize>(
        &self,
        run_id: &str,
        pipeline: &str,
        stage: Stage,
        state: &T,
    ) -> Result<(), PipelineError> {
        let state_json = serde_json::to_string(state)
            .map_err(|e| PipelineError::Checkpoint(format!("cannot serialize run state: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO run_checkpoints (run_id, pipeline, stage, state_json, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                pipeline = excluded.pipeline,
                stage = excluded.stage,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(run_id)
        .bind(pipeline)
        .bind(stage.as_str())
        .bind(&state_json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Checkpoint(e.to_string()))?;
        Ok(())
    }

    /// Last completed stage and state of `run_id`, if any.
    pub async fn load<T: DeserializeOwned>(&self, run_id: &str) -> Result<Option<(Stage, T)>, PipelineError> {
        let row = sqlx::query("SELECT stage, state_json FROM run_checkpoints WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PipelineError::Checkpoint(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stage: String = row.get("stage");
        let stage = stage.parse::<Stage>().map_err(PipelineError::Checkpoint)?;
        let state_json: String = row.get("state_json");
        let state = serde_json::from_str(&state_json).map_err(|e| {
            PipelineError::Checkpoint(format!("corrupt checkpoint for run {}: {}", run_id, e))
        })?;
        Ok(Some((stage, state)))
    }

    /// Most recently updated checkpoints first.
    pub async fn list(&self, limit: i64) -> sqlx::Result<Vec<CheckpointInfo>> {
        let rows = sqlx::query(
            "SELECT run_id, pipeline, stage, updated_at FROM run_checkpoints ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let stage: String = row.get("stage");
                Some(CheckpointInfo {
                    run_id: row.get("run_id"),
                    pipeline: row.get("pipeline"),
                    stage: stage.parse().ok()?,
                    updated_at: row.get("updated_at"),
                })
            })
            .collect())
    }

    pub async fn delete(&self, run_id: &str) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM run_checkpoints WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Progress {
        files: Vec<String>,
    }

    #[tokio::test]
    async fn save_overwrites_and_load_returns_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(&tmp.path().join("checkpoints").join("index.sqlite"))
            .await
            .unwrap();

        assert!(store.load::<Progress>("run-1").await.unwrap().is_none());

        let mut state = Progress {
            files: vec!["/a".to_string()],
        };
        store.save("run-1", "index", Stage::Discover, &state).await.unwrap();
        state.files.push("/b".to_string());
        store.save("run-1", "index", Stage::Diff, &state).await.unwrap();

        let (stage, loaded) = store.load::<Progress>("run-1").await.unwrap().unwrap();
        assert_eq!(stage, Stage::Diff);
        assert_eq!(loaded, state);

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].stage, Stage::Diff);

        assert!(store.delete("run-1").await.unwrap());
        assert!(store.load::<Progress>("run-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_state_is_a_checkpoint_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(&tmp.path().join("c.sqlite")).await.unwrap();
        store
            .save("run-2", "index", Stage::Discover, &serde_json::json!({"files": 3}))
            .await
            .unwrap();
        let err = store.load::<Progress>("run-2").await.unwrap_err();
        assert!(matches!(err, PipelineError::Checkpoint(_)));
    }
}
