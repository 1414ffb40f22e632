//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the seam between the pipelines and the
//! storage of embeddings. Two backends ship:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`SqliteVectorIndex`] | persistent collection in a SQLite file |
//! | [`InMemoryVectorIndex`] | tests and throwaway runs |
//!
//! Both do brute-force cosine similarity over the collection. Records are
//! keyed by id, so upserting the same id twice leaves one record. Files with
//! the same content produce the same ids; every path that upserted an id owns
//! it, and the record lives until its last owner releases it.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{VectorMetadata, VectorRecord};

/// Metadata equality filter: every key must be present with an equal value.
pub type MetadataFilter = serde_json::Map<String, serde_json::Value>;

/// One ranked result of [`VectorIndex::query`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorMatch {
    pub id: String,
    pub document: String,
    pub metadata: VectorMetadata,
    /// Cosine similarity; higher is closer.
    pub score: f64,
    /// `1 - score`.
    pub distance: f64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Name of the collection this handle reads and writes.
    fn collection(&self) -> &str;

    /// Insert or replace records by id, adding each record's path to the
    /// id's owners.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Up to `k` nearest records by cosine similarity, best first.
    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>>;

    /// Releases `path` from every id it owns that is not in `keep_ids`.
    /// Returns the number of records deleted because no owner was left.
    async fn retain_for_path(&self, path: &str, keep_ids: &[String]) -> Result<usize>;

    /// Releases `path` from every id it owns. Returns the number of records
    /// deleted.
    async fn delete_path(&self, path: &str) -> Result<usize>;

    async fn count(&self) -> Result<usize>;
}

/// Whether `metadata` satisfies every key of `filter`.
///
/// A string filter value also matches a number or boolean with the same
/// textual form, so `chunk_idx=2` from the command line matches `2`.
pub fn matches_filter(metadata: &VectorMetadata, filter: &MetadataFilter) -> bool {
    let Ok(serde_json::Value::Object(meta)) = serde_json::to_value(metadata) else {
        return false;
    };
    filter.iter().all(|(key, want)| match meta.get(key) {
        Some(have) if have == want => true,
        Some(have) => match (have, want) {
            (serde_json::Value::Number(_) | serde_json::Value::Bool(_), serde_json::Value::String(s)) => {
                have.to_string() == *s
            }
            _ => false,
        },
        None => false,
    })
}

/// Sorts by score (best first, ties by id) and keeps the top `k`.
pub(crate) fn rank(mut matches: Vec<VectorMatch>, k: usize) -> Vec<VectorMatch> {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    matches.truncate(k);
    matches
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::models::{VectorMetadata, VectorRecord};

    pub fn record(id: &str, path: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            embedding,
            document: format!("text of {}", id),
            metadata: VectorMetadata {
                path: path.to_string(),
                sha256: id.split(':').next().unwrap_or(id).to_string(),
                chunk_idx: id
                    .rsplit(':')
                    .next()
                    .and_then(|i| i.parse().ok())
                    .unwrap_or(0),
                mime: "text/plain".to_string(),
                ext: ".txt".to_string(),
                mtime_ns: 0,
                embedding_model: "offline-hash".to_string(),
                char_start: 0,
                char_end: 0,
            },
        }
    }
}
