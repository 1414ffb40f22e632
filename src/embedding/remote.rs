//! HTTP embedding providers: OpenAI and Ollama.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{backoff_delay, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::EmbedError;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";

fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Retry budget of one provider.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    request_timeout: Duration,
}

impl RetryPolicy {
    fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            request_timeout: config.timeout(),
        }
    }
}

/// POST `body` to `url`, retrying transient failures with exponential backoff.
///
/// When the last attempt timed out the result is [`EmbedError::Timeout`].
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    policy: RetryPolicy,
    label: &str,
) -> Result<serde_json::Value, EmbedError> {
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            debug!(provider = label, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json::<serde_json::Value>().await.map_err(|e| {
                        EmbedError::Provider(format!("{} returned invalid JSON: {}", label, e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    return Err(EmbedError::Authentication(format!(
                        "{} API error {}: {}",
                        label, status, body_text
                    )));
                }

                let err = EmbedError::Provider(format!("{} API error {}: {}", label, status, body_text));
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    warn!(provider = label, %status, attempt, "transient embedding error");
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                warn!(provider = label, error = %e, attempt, "embedding request failed");
                last_err = Some(if e.is_timeout() {
                    EmbedError::Timeout(policy.request_timeout)
                } else {
                    EmbedError::Provider(format!("{} connection error ({}): {}", label, url, e))
                });
            }
        }
    }

    Err(last_err.unwrap_or_else(|| EmbedError::Provider(format!("{} embedding failed after retries", label))))
}

fn invalid(label: &str, what: &str) -> EmbedError {
    EmbedError::Provider(format!("Invalid {} response: {}", label, what))
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Checks that the provider returned one vector per input.
fn expect_count(label: &str, got: usize, want: usize) -> Result<(), EmbedError> {
    if got != want {
        return Err(invalid(
            label,
            &format!("expected {} embeddings, got {}", want, got),
        ));
    }
    Ok(())
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API (`POST {url}/embeddings`).
///
/// The API key comes from `OPENAI_API_KEY`, falling back to `AI_API_KEY`.
/// A missing key is reported as [`EmbedError::Authentication`] when the
/// provider is first used, not when it is built.
#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .or_else(|_| std::env::var("AI_API_KEY"))
            .ok()
            .filter(|k| !k.is_empty());

        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            dims: config.dims.unwrap_or(1536),
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            retry: RetryPolicy::from_config(config),
            client: build_client(config.timeout())?,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn with_model(&self, model: &str) -> Result<Arc<dyn EmbeddingProvider>, EmbedError> {
        let mut next = self.clone();
        next.model = model.to_string();
        Ok(Arc::new(next))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            EmbedError::Authentication("OPENAI_API_KEY (or AI_API_KEY) not set".to_string())
        })?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/embeddings", self.base_url);
        let json = post_with_retry(&self.client, &url, Some(api_key), &body, self.retry, "OpenAI").await?;
        let vectors = parse_openai_response(&json)?;
        expect_count("OpenAI", vectors.len(), texts.len())?;
        Ok(vectors)
    }
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
pub(crate) fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid("OpenAI", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid("OpenAI", "missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32_vec(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance (`POST {url}/api/embed`).
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    model: String,
    dims: usize,
    base_url: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;

        Ok(Self {
            model,
            dims,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            retry: RetryPolicy::from_config(config),
            client: build_client(config.timeout())?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn with_model(&self, model: &str) -> Result<Arc<dyn EmbeddingProvider>, EmbedError> {
        let mut next = self.clone();
        next.model = model.to_string();
        Ok(Arc::new(next))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/api/embed", self.base_url);
        let json = post_with_retry(&self.client, &url, None, &body, self.retry, "Ollama").await?;
        let vectors = parse_ollama_response(&json)?;
        expect_count("Ollama", vectors.len(), texts.len())?;
        Ok(vectors)
    }
}

pub(crate) fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| invalid("Ollama", "missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_f32_vec(values))
                .ok_or_else(|| invalid("Ollama", "embedding is not an array"))
        })
        .collect()
}
