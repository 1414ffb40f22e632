//! Error taxonomy for the indexing and query pipelines.
//!
//! Two tiers:
//! - [`RunIssue`]: per-file conditions that are recorded in a run's
//!   `errors` list while the run continues.
//! - [`PipelineError`]: run-fatal conditions. The pipelines wrap them in a
//!   [`StageFailure`] naming the stage that failed.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::Stage;

/// Errors raised by an [`EmbeddingProvider`](crate::embedding::EmbeddingProvider).
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedError {
    /// Credentials are missing or were rejected. Never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Transport, rate-limit or response-shape failure.
    #[error("embedding provider error: {0}")]
    Provider(String),

    /// The last HTTP attempt, or the whole batch deadline, ran out.
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
}

/// Run-fatal pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A stage produced a state that violates the next stage's preconditions.
    #[error("invalid run state: {0}")]
    InvalidState(String),

    #[error("worker task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Task(e.to_string())
    }
}

/// A fatal error together with the stage that raised it.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {source}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

impl StageFailure {
    /// True when the failure is a credential problem the caller must fix
    /// before retrying.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self.source,
            PipelineError::Embed(EmbedError::Authentication(_))
        )
    }
}

/// Non-fatal, per-file condition recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunIssue {
    /// No extractor is compiled in for this document type.
    MissingCapability { path: String, detail: String },
    /// Extraction produced no usable text.
    EmptyContent { path: String },
    /// The file (or root) could not be read.
    ReadFailure { path: String, detail: String },
    /// The extractor rejected the file as malformed.
    ParseFailure { path: String, detail: String },
}

impl RunIssue {
    pub fn path(&self) -> &str {
        match self {
            RunIssue::MissingCapability { path, .. }
            | RunIssue::EmptyContent { path }
            | RunIssue::ReadFailure { path, .. }
            | RunIssue::ParseFailure { path, .. } => path,
        }
    }
}

impl fmt::Display for RunIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunIssue::MissingCapability { path, detail } => {
                write!(f, "parse-missing-parser:{}:{}", path, detail)
            }
            RunIssue::EmptyContent { path } => write!(f, "parse-empty:{}", path),
            RunIssue::ReadFailure { path, detail } => write!(f, "read-failure:{}:{}", path, detail),
            RunIssue::ParseFailure { path, detail } => write!(f, "parse-failed:{}:{}", path, detail),
        }
    }
}
