//! TOML configuration for the indexer.
//!
//! Every section except `[index]` roots has defaults, so a minimal file only
//! needs `[storage]` and `[embedding]`. See [`load_config`] for validation
//! rules.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::embedding::backoff_delay;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub vector_path: Option<PathBuf>,
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ledger_path: None,
            vector_path: None,
            checkpoint_path: None,
            collection: default_collection(),
        }
    }
}

impl StorageConfig {
    /// SQLite file holding files, queries and audit tables.
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ledger.sqlite"))
    }

    /// SQLite file backing the vector collection.
    pub fn vector_path(&self) -> PathBuf {
        self.vector_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("vectors").join("index.sqlite"))
    }

    /// SQLite file holding per-run pipeline checkpoints.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("checkpoints").join("index.sqlite"))
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_collection() -> String {
    "docs_v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_allow_extensions")]
    pub allow_extensions: Vec<String>,
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            allow_extensions: default_allow_extensions(),
            exclude_dirs: default_exclude_dirs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            workers: default_workers(),
        }
    }
}

fn default_allow_extensions() -> Vec<String> {
    [".txt", ".md", ".rst", ".py", ".java", ".pdf", ".docx", ".pptx"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_exclude_dirs() -> Vec<String> {
    [
        ".git",
        ".hg",
        ".svn",
        ".venv",
        "venv",
        "__pycache__",
        "node_modules",
        "target",
        "data",
        "chroma",
        "checkpoints",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_target_tokens() -> usize {
    800
}
fn default_overlap() -> usize {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Deadline for one embedding call, retries included. Derived from
    /// `timeout_secs` and `max_retries` when unset.
    #[serde(default)]
    pub batch_timeout_secs: Option<u64>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            batch_timeout_secs: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Room for every attempt to time out plus the backoff between them.
    pub fn batch_timeout(&self) -> Duration {
        if let Some(secs) = self.batch_timeout_secs {
            return Duration::from_secs(secs);
        }
        let backoff: Duration = (1..=self.max_retries).map(backoff_delay).sum();
        self.timeout() * (self.max_retries + 1) + backoff
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_top_k() -> usize {
    10
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Checks cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.target_tokens {
        anyhow::bail!(
            "chunking.overlap_tokens ({}) must be smaller than chunking.target_tokens ({})",
            config.chunking.overlap_tokens,
            config.chunking.target_tokens
        );
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be > 0");
    }
    if config.index.workers == 0 {
        anyhow::bail!("index.workers must be > 0");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.embedding.timeout_secs == 0 || config.embedding.batch_timeout_secs == Some(0) {
        anyhow::bail!("embedding timeouts must be > 0");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0 when set");
    }

    for ext in &config.index.allow_extensions {
        if !ext.starts_with('.') {
            anyhow::bail!(
                "index.allow_extensions entries must start with '.', got '{}'",
                ext
            );
        }
    }

    match config.embedding.provider.as_str() {
        "openai" | "ollama" | "offline" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai, ollama, offline, or local.",
            other
        ),
    }

    Ok(())
}
