//! Core data models that flow through the indexing and query pipelines.

use serde::{Deserialize, Serialize};

/// A file found by discovery. Not persisted until the run commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Absolute path; unique within a root set.
    pub path: String,
    pub byte_size: u64,
    pub mtime_ns: i64,
    /// SHA-256 hex of the content, or the `ext:size:mtime` fallback.
    pub fingerprint: String,
    pub media_type: String,
    /// Lowercase with the leading dot, empty when the file has none.
    pub extension: String,
}

/// Persisted counterpart of [`FileDescriptor`] in the `files` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerFileRecord {
    pub path: String,
    pub bytes: i64,
    pub mtime_ns: i64,
    pub sha256: String,
    pub mime: String,
    pub last_indexed_at: String,
}

impl LedgerFileRecord {
    pub fn from_descriptor(file: &FileDescriptor, indexed_at: &str) -> Self {
        Self {
            path: file.path.clone(),
            bytes: i64::try_from(file.byte_size).unwrap_or(i64::MAX),
            mtime_ns: file.mtime_ns,
            sha256: file.fingerprint.clone(),
            mime: file.media_type.clone(),
            last_indexed_at: indexed_at.to_string(),
        }
    }
}

/// A span of a document's text, the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub file: FileDescriptor,
    pub chunk_index: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub text: String,
}

impl Chunk {
    /// Vector-index identity: stable across runs for the same content and
    /// chunking parameters.
    pub fn vector_id(&self) -> String {
        vector_id(&self.file.fingerprint, self.chunk_index)
    }
}

pub fn vector_id(fingerprint: &str, chunk_index: usize) -> String {
    format!("{}:{}", fingerprint, chunk_index)
}

/// Metadata stored alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub path: String,
    pub sha256: String,
    pub chunk_idx: usize,
    pub mime: String,
    pub ext: String,
    pub mtime_ns: i64,
    pub embedding_model: String,
    #[serde(default)]
    pub char_start: usize,
    #[serde(default)]
    pub char_end: usize,
}

/// A vector with its source text and metadata, as upserted into the index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: VectorMetadata,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &Chunk, embedding: Vec<f32>, model: &str) -> Self {
        Self {
            id: chunk.vector_id(),
            embedding,
            document: chunk.text.clone(),
            metadata: VectorMetadata {
                path: chunk.file.path.clone(),
                sha256: chunk.file.fingerprint.clone(),
                chunk_idx: chunk.chunk_index,
                mime: chunk.file.media_type.clone(),
                ext: chunk.file.extension.clone(),
                mtime_ns: chunk.file.mtime_ns,
                embedding_model: model.to_string(),
                char_start: chunk.char_start,
                char_end: chunk.char_end,
            },
        }
    }
}

/// One ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: String,
    pub text: String,
    /// Cosine similarity; higher is closer.
    pub score: f64,
    pub meta: VectorMetadata,
}

/// Audit row for one executed query.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub user_id: String,
    pub qtext: String,
    pub top_k: i64,
    pub filters_json: Option<String>,
    pub model: Option<String>,
    pub latency_ms: i64,
    pub response_json: String,
}

/// Audit row for one ranked hit of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    pub query_id: i64,
    pub rank: i64,
    pub score: f64,
    pub path: String,
    pub chunk_idx: i64,
    pub sha256: String,
    pub snippet: String,
}

/// Maximum snippet length (in characters) stored per query hit.
pub const SNIPPET_MAX_CHARS: usize = 2000;

impl QueryHit {
    pub fn from_hit(query_id: i64, rank: usize, hit: &Hit) -> Self {
        Self {
            query_id,
            rank: rank as i64,
            score: hit.score,
            path: hit.meta.path.clone(),
            chunk_idx: hit.meta.chunk_idx as i64,
            sha256: hit.meta.sha256.clone(),
            snippet: hit.text.chars().take(SNIPPET_MAX_CHARS).collect(),
        }
    }
}

/// One row of the external web-search collaborator's ranked results.
#[derive(Debug, Clone, Default)]
pub struct WebResult {
    pub title: Option<String>,
    pub url: Option<String>,
    pub snippet: Option<String>,
    pub source: Option<String>,
}

/// Outcome of fetching one URL for the web-search collaborator.
#[derive(Debug, Clone, Default)]
pub struct WebFetch {
    pub url: Option<String>,
    pub ok: bool,
    pub status_code: Option<i64>,
    pub text_length: Option<i64>,
    pub error: Option<String>,
    pub elapsed_ms: Option<i64>,
}

/// One API-level event logged by the HTTP collaborator.
#[derive(Debug, Clone)]
pub struct ApiEvent {
    pub user_id: Option<String>,
    pub api: String,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    pub status: String,
    pub latency_ms: i64,
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> FileDescriptor {
        FileDescriptor {
            path: "/docs/a.md".to_string(),
            byte_size: 12,
            mtime_ns: 1_700_000_000_000_000_000,
            fingerprint: "abc".to_string(),
            media_type: "text/markdown".to_string(),
            extension: ".md".to_string(),
        }
    }

    #[test]
    fn vector_id_joins_fingerprint_and_index() {
        let chunk = Chunk {
            file: descriptor(),
            chunk_index: 3,
            char_start: 0,
            char_end: 5,
            text: "hello".to_string(),
        };
        assert_eq!(chunk.vector_id(), "abc:3");
    }

    #[test]
    fn query_hit_truncates_snippet() {
        let hit = Hit {
            id: "abc:0".to_string(),
            text: "é".repeat(SNIPPET_MAX_CHARS + 10),
            score: 0.5,
            meta: VectorMetadata {
                path: "/docs/a.md".to_string(),
                sha256: "abc".to_string(),
                chunk_idx: 0,
                mime: "text/markdown".to_string(),
                ext: ".md".to_string(),
                mtime_ns: 0,
                embedding_model: "offline".to_string(),
                char_start: 0,
                char_end: 0,
            },
        };
        let row = QueryHit::from_hit(7, 1, &hit);
        assert_eq!(row.snippet.chars().count(), SNIPPET_MAX_CHARS);
        assert_eq!(row.rank, 1);
        assert_eq!(row.query_id, 7);
    }
}
