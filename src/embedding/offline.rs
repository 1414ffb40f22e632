//! Deterministic embeddings that need no model and no network.
//!
//! Each lowercase alphanumeric word is hashed (SHA-256) into one of `dims`
//! buckets; the bucket counts are L2-normalised. Texts sharing words score
//! higher under cosine similarity, which is enough for local runs and tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::error::EmbedError;

pub const DEFAULT_MODEL: &str = "offline-hash";
pub const DEFAULT_DIMS: usize = 1024;

#[derive(Debug, Clone)]
pub struct OfflineProvider {
    model: String,
    dims: usize,
}

impl OfflineProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self::with_dims(
            config.model.as_deref().unwrap_or(DEFAULT_MODEL),
            config.dims.unwrap_or(DEFAULT_DIMS),
        )
    }

    pub fn with_dims(model: &str, dims: usize) -> Self {
        Self {
            model: model.to_string(),
            dims: dims.max(1),
        }
    }

    /// Embeds one text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let digest = Sha256::digest(word.to_lowercase().as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(head) % self.dims as u64) as usize;
            v[bucket] += 1.0;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for OfflineProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn with_model(&self, model: &str) -> Result<Arc<dyn EmbeddingProvider>, EmbedError> {
        Ok(Arc::new(Self::with_dims(model, self.dims)))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
