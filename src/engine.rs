//! Wires configuration, storage and the pipelines together.
//!
//! [`Engine`] is what the CLI (and any embedding application) talks to:
//! `index` runs the indexing pipeline, `search` runs the query pipeline and
//! writes the audit rows to the ledger.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::discover::Discoverer;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{PipelineError, StageFailure};
use crate::ledger::Ledger;
use crate::models::{Hit, QueryHit, QueryRecord};
use crate::pipeline::index::IndexSettings;
use crate::pipeline::{AnswerHook, IndexOutcome, IndexPipeline, IndexRequest, QueryPipeline, QueryRequest, Stage};
use crate::store::{MetadataFilter, SqliteVectorIndex, VectorIndex};

/// A search as issued by a user.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub user_id: String,
    pub query: String,
    /// `retrieval.top_k` when `None`.
    pub top_k: Option<usize>,
    pub filters: Option<MetadataFilter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query_id: i64,
    pub latency_ms: i64,
    pub hits: Vec<Hit>,
}

pub struct Engine {
    config: Config,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    ledger: Ledger,
    checkpoints: CheckpointStore,
    hook: Option<Arc<dyn AnswerHook>>,
}

impl Engine {
    /// Opens (creating when missing) the ledger, vector and checkpoint
    /// databases named by `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let index = SqliteVectorIndex::open(&config.storage.vector_path(), &config.storage.collection)
            .await
            .context("Failed to open vector index")?;
        let ledger = Ledger::open(&config.storage.ledger_path())
            .await
            .context("Failed to open ledger")?;
        let checkpoints = CheckpointStore::open(&config.storage.checkpoint_path())
            .await
            .context("Failed to open checkpoint store")?;
        Self::with_components(config, embedder, Arc::new(index), ledger, checkpoints)
    }

    pub fn with_components(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        ledger: Ledger,
        checkpoints: CheckpointStore,
    ) -> Result<Self> {
        crate::config::validate(&config)?;
        Ok(Self {
            config,
            embedder,
            index,
            ledger,
            checkpoints,
            hook: None,
        })
    }

    pub fn with_answer_hook(mut self, hook: Arc<dyn AnswerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn index_handle(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Runs an indexing pass. Empty `request.roots` falls back to
    /// `index.roots` from the configuration.
    pub async fn index(&self, request: IndexRequest, run_id: Option<&str>) -> Result<IndexOutcome, StageFailure> {
        let mut request = request;
        if request.roots.is_empty() {
            request.roots = self.config.index.roots.clone();
        }

        let discoverer = Discoverer::from_config(&self.config).map_err(|e| StageFailure {
            stage: Stage::Discover,
            source: PipelineError::InvalidState(format!("{:#}", e)),
        })?;
        let pipeline = IndexPipeline::new(
            discoverer,
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.ledger.clone(),
            self.checkpoints.clone(),
            IndexSettings::from_config(&self.config),
        );
        pipeline.run(&request, run_id).await
    }

    /// Runs a query and records it, with its ranked hits, in the ledger.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, StageFailure> {
        let started = Instant::now();
        let top_k = request.top_k.unwrap_or(self.config.retrieval.top_k);

        let mut pipeline = QueryPipeline::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.config.retrieval.timeout(),
        )
        .with_embed_timeout(self.config.embedding.batch_timeout());
        if let Some(hook) = &self.hook {
            pipeline = pipeline.with_hook(Arc::clone(hook));
        }

        let hits = pipeline
            .run(&QueryRequest {
                query: request.query.clone(),
                top_k,
                filters: request.filters.clone(),
            })
            .await?;
        let latency_ms = started.elapsed().as_millis() as i64;

        let query_id = self
            .record(&request, top_k, pipeline.model_name(), latency_ms, &hits)
            .await
            .map_err(|source| StageFailure {
                stage: Stage::Finalize,
                source,
            })?;

        info!(query_id, hits = hits.len(), latency_ms, "search finished");
        Ok(SearchResponse {
            query_id,
            latency_ms,
            hits,
        })
    }

    async fn record(
        &self,
        request: &SearchRequest,
        top_k: usize,
        model: &str,
        latency_ms: i64,
        hits: &[Hit],
    ) -> Result<i64, PipelineError> {
        self.ledger.ensure_user(&request.user_id, None).await?;

        let filters_json = match &request.filters {
            Some(filters) => Some(serde_json::to_string(filters).map_err(|e| {
                PipelineError::InvalidState(format!("cannot serialize filters: {}", e))
            })?),
            None => None,
        };
        let response_json = serde_json::to_string(&serde_json::json!({ "hits": hits }))
            .map_err(|e| PipelineError::InvalidState(format!("cannot serialize hits: {}", e)))?;

        let query_id = self
            .ledger
            .log_query(&QueryRecord {
                user_id: request.user_id.clone(),
                qtext: request.query.clone(),
                top_k: top_k as i64,
                filters_json,
                model: Some(model.to_string()),
                latency_ms,
                response_json,
            })
            .await?;

        let rows: Vec<QueryHit> = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| QueryHit::from_hit(query_id, i + 1, hit))
            .collect();
        if let Err(e) = self.ledger.log_query_hits(&rows).await {
            warn!(query_id, error = %e, "failed to record query hits");
            return Err(e.into());
        }
        Ok(query_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::OfflineProvider;
    use crate::store::InMemoryVectorIndex;
    use sqlx::Row;

    async fn engine(tmp: &std::path::Path) -> Engine {
        let mut config = Config::default();
        config.embedding.provider = "offline".to_string();
        config.storage.data_dir = tmp.join("data");
        config.index.roots = vec![tmp.join("docs")];
        let ledger = Ledger::open(&config.storage.ledger_path()).await.unwrap();
        let checkpoints = CheckpointStore::open(&config.storage.checkpoint_path()).await.unwrap();
        Engine::with_components(
            config,
            Arc::new(OfflineProvider::with_dims("offline-hash", 512)),
            Arc::new(InMemoryVectorIndex::default()),
            ledger,
            checkpoints,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn search_logs_query_and_hits() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs")).unwrap();
        std::fs::write(tmp.path().join("docs/a.txt"), "rust ownership and borrowing").unwrap();
        std::fs::write(tmp.path().join("docs/b.txt"), "sqlite write ahead log").unwrap();

        let engine = engine(tmp.path()).await;
        let outcome = engine.index(IndexRequest::default(), None).await.unwrap();
        assert_eq!(outcome.stats.committed, 2);

        let response = engine
            .search(SearchRequest {
                user_id: "alice".to_string(),
                query: "borrowing".to_string(),
                top_k: Some(2),
                filters: None,
            })
            .await
            .unwrap();
        assert_eq!(response.hits.len(), 2);
        assert!(response.hits[0].meta.path.ends_with("a.txt"));

        let pool = engine.ledger().pool();
        let row = sqlx::query("SELECT user_id, qtext, top_k, model FROM queries WHERE id = ?")
            .bind(response.query_id)
            .fetch_one(pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("user_id"), "alice");
        assert_eq!(row.get::<String, _>("qtext"), "borrowing");
        assert_eq!(row.get::<i64, _>("top_k"), 2);
        assert_eq!(row.get::<String, _>("model"), "offline-hash");

        let ranks: Vec<i64> = sqlx::query_scalar("SELECT rank FROM query_hits WHERE query_id = ? ORDER BY rank")
            .bind(response.query_id)
            .fetch_all(pool)
            .await
            .unwrap();
        assert_eq!(ranks, vec![1, 2]);

        let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE user_id = 'alice'")
            .fetch_one(pool)
            .await
            .unwrap();
        assert_eq!(users, 1);
    }

    #[tokio::test]
    async fn search_on_empty_index_still_logs_the_query() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path()).await;
        let response = engine
            .search(SearchRequest {
                user_id: "bob".to_string(),
                query: "anything".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(response.hits.is_empty());
        assert!(response.query_id > 0);
        assert_eq!(engine.ledger().summary().await.unwrap().queries, 1);
    }
}
