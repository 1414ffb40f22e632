//! Resumable multi-stage pipelines.
//!
//! ```text
//! index:  Discover → Diff → ParseAndChunk → EmbedBatch → UpsertVectors → CommitRun → Done
//! query:  EmbedQuery → AnnSearch → Finalize → Done
//! ```
//!
//! Each pipeline transforms an explicit, serializable run state one stage at
//! a time. Stages run strictly in order; the indexing pipeline checkpoints
//! its state after every completed stage (see [`crate::checkpoint`]).

pub mod index;
pub mod query;

pub use index::{IndexOutcome, IndexPipeline, IndexRequest, RunState, RunStats};
pub use query::{AnswerHook, QueryPipeline, QueryRequest};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Diff,
    ParseAndChunk,
    EmbedBatch,
    UpsertVectors,
    CommitRun,
    EmbedQuery,
    AnnSearch,
    Finalize,
    Done,
}

impl Stage {
    /// The stage that follows `self` in its pipeline.
    pub fn next(self) -> Stage {
        match self {
            Stage::Discover => Stage::Diff,
            Stage::Diff => Stage::ParseAndChunk,
            Stage::ParseAndChunk => Stage::EmbedBatch,
            Stage::EmbedBatch => Stage::UpsertVectors,
            Stage::UpsertVectors => Stage::CommitRun,
            Stage::CommitRun => Stage::Done,
            Stage::EmbedQuery => Stage::AnnSearch,
            Stage::AnnSearch => Stage::Finalize,
            Stage::Finalize => Stage::Done,
            Stage::Done => Stage::Done,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discover => "discover",
            Stage::Diff => "diff",
            Stage::ParseAndChunk => "parse_and_chunk",
            Stage::EmbedBatch => "embed_batch",
            Stage::UpsertVectors => "upsert_vectors",
            Stage::CommitRun => "commit_run",
            Stage::EmbedQuery => "embed_query",
            Stage::AnnSearch => "ann_search",
            Stage::Finalize => "finalize",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Stage::Discover,
            Stage::Diff,
            Stage::ParseAndChunk,
            Stage::EmbedBatch,
            Stage::UpsertVectors,
            Stage::CommitRun,
            Stage::EmbedQuery,
            Stage::AnnSearch,
            Stage::Finalize,
            Stage::Done,
        ]
        .into_iter()
        .find(|stage| stage.as_str() == s)
        .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_stages_run_in_order() {
        let mut stage = Stage::Discover;
        let mut seen = vec![stage];
        while stage != Stage::Done {
            stage = stage.next();
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                Stage::Discover,
                Stage::Diff,
                Stage::ParseAndChunk,
                Stage::EmbedBatch,
                Stage::UpsertVectors,
                Stage::CommitRun,
                Stage::Done
            ]
        );
    }

    #[test]
    fn names_round_trip() {
        for stage in [Stage::ParseAndChunk, Stage::AnnSearch, Stage::Done] {
            assert_eq!(stage.to_string().parse::<Stage>().unwrap(), stage);
        }
        assert!("warp".parse::<Stage>().is_err());
    }
}
