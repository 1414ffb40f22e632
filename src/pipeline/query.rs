//! The query pipeline: `EmbedQuery → AnnSearch → Finalize → Done`.
//!
//! Queries are short-lived and are not checkpointed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Stage;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{EmbedError, PipelineError, StageFailure};
use crate::models::Hit;
use crate::store::{MetadataFilter, VectorIndex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub top_k: usize,
    #[serde(default)]
    pub filters: Option<MetadataFilter>,
}

/// Post-processing applied to ranked hits before they are returned, e.g.
/// answer synthesis by an external collaborator.
#[async_trait]
pub trait AnswerHook: Send + Sync {
    async fn finalize(&self, query: &str, hits: Vec<Hit>) -> Result<Vec<Hit>, PipelineError>;
}

pub struct QueryPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    timeout: Duration,
    embed_timeout: Duration,
    hook: Option<Arc<dyn AnswerHook>>,
}

impl QueryPipeline {
    /// `timeout` bounds every call into the vector index, and the query
    /// embedding unless [`with_embed_timeout`](Self::with_embed_timeout) says otherwise.
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, index: Arc<dyn VectorIndex>, timeout: Duration) -> Self {
        Self {
            embedder,
            index,
            timeout,
            embed_timeout: timeout,
            hook: None,
        }
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn AnswerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Ranked hits for `request`, best first. An empty index yields no hits
    /// without calling the embedder.
    pub async fn run(&self, request: &QueryRequest) -> Result<Vec<Hit>, StageFailure> {
        let size = self
            .bounded("vector count", self.index.count())
            .await
            .map_err(|source| StageFailure {
                stage: Stage::EmbedQuery,
                source,
            })?;
        if size == 0 || request.top_k == 0 {
            debug!(size, top_k = request.top_k, "nothing to search");
            return Ok(Vec::new());
        }

        let embedding = tokio::time::timeout(self.embed_timeout, embed_query(self.embedder.as_ref(), &request.query))
            .await
            .map_err(|_| EmbedError::Timeout(self.embed_timeout))
            .and_then(|r| r)
            .map_err(PipelineError::from)
            .map_err(|source| StageFailure {
                stage: Stage::EmbedQuery,
                source,
            })?;

        let matches = self
            .bounded(
                "vector search",
                self.index
                    .query(&embedding, request.top_k, request.filters.as_ref()),
            )
            .await
            .map_err(|source| StageFailure {
                stage: Stage::AnnSearch,
                source,
            })?;
        debug!(matches = matches.len(), "vector search finished");

        let hits: Vec<Hit> = matches
            .into_iter()
            .map(|m| Hit {
                id: m.id,
                text: m.document,
                score: m.score,
                meta: m.metadata,
            })
            .collect();

        match &self.hook {
            Some(hook) => hook
                .finalize(&request.query, hits)
                .await
                .map_err(|source| StageFailure {
                    stage: Stage::Finalize,
                    source,
                }),
            None => Ok(hits),
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, PipelineError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| PipelineError::Timeout {
                operation,
                after: self.timeout,
            })?
            .map_err(|e| PipelineError::IndexUnavailable(format!("{:#}", e)))
    }
}
