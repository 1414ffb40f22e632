//! The indexing pipeline.
//!
//! ```text
//! Discover → Diff → ParseAndChunk → EmbedBatch → UpsertVectors → CommitRun → Done
//! ```
//!
//! - **Discover** walks the roots ([`Discoverer`]).
//! - **Diff** keeps new and modified files, or everything for full/forced runs.
//! - **ParseAndChunk** extracts text and splits it into token windows on the
//!   blocking pool. Files that cannot be parsed are recorded as issues and
//!   dropped from the run.
//! - **EmbedBatch** embeds chunk texts in batches, several batches in flight,
//!   results kept in chunk order.
//! - **UpsertVectors** writes each file's vectors and prunes that file's ids
//!   the run no longer produces.
//! - **CommitRun** records fully upserted files in the ledger, last.
//!
//! The run state is checkpointed after every stage. Calling [`IndexPipeline::run`]
//! with the id of an unfinished run continues after its last completed stage.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info, warn};

use super::Stage;
use crate::checkpoint::CheckpointStore;
use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, Config};
use crate::diff::{select_changed, IndexMode};
use crate::discover::{absolute, Discoverer};
use crate::embedding::EmbeddingProvider;
use crate::error::{EmbedError, PipelineError, RunIssue, StageFailure};
use crate::extract::parse_document;
use crate::ledger::Ledger;
use crate::models::{Chunk, FileDescriptor, LedgerFileRecord, VectorRecord};
use crate::store::VectorIndex;

const PIPELINE: &str = "index";

/// What to index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexRequest {
    pub mode: IndexMode,
    pub roots: Vec<PathBuf>,
    /// Embedding model override; the provider's model when `None`.
    pub model: Option<String>,
    pub force_reembed: bool,
    /// Delete ledger rows and vectors of files under the roots that no
    /// longer exist.
    pub prune_missing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub discovered: usize,
    pub changed: usize,
    pub chunks: usize,
    pub upserted: usize,
    pub committed: usize,
    /// Changed files dropped because they could not be parsed.
    pub skipped: usize,
    /// Vectors of re-indexed files that the run no longer produced.
    pub stale_vectors: usize,
    /// Files removed because they disappeared from the roots.
    pub pruned: usize,
}

/// Everything a run knows, checkpointed between stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub mode: IndexMode,
    pub roots: Vec<PathBuf>,
    pub model: String,
    pub force_reembed: bool,
    pub prune_missing: bool,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
    #[serde(default)]
    pub changed: Vec<FileDescriptor>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
    /// Paths whose every chunk has been upserted.
    #[serde(default)]
    pub upserted_paths: Vec<String>,
    #[serde(default)]
    pub stats: RunStats,
    #[serde(default)]
    pub errors: Vec<RunIssue>,
}

impl RunState {
    fn new(run_id: String, request: &IndexRequest, model: String) -> Self {
        Self {
            run_id,
            mode: request.mode,
            roots: request.roots.iter().map(|r| absolute(r)).collect(),
            model,
            force_reembed: request.force_reembed,
            prune_missing: request.prune_missing,
            files: Vec::new(),
            changed: Vec::new(),
            chunks: Vec::new(),
            embeddings: Vec::new(),
            upserted_paths: Vec::new(),
            stats: RunStats::default(),
            errors: Vec::new(),
        }
    }

    /// Drops what no later stage reads once `stage` has completed, so the
    /// checkpoints after it stay small.
    fn compact_after(&mut self, stage: Stage) {
        if matches!(stage, Stage::UpsertVectors | Stage::CommitRun) {
            self.chunks = Vec::new();
            self.embeddings = Vec::new();
        }
    }

    /// Checks the preconditions of `stage` against the current state.
    fn validate_for(&self, stage: Stage) -> Result<(), PipelineError> {
        match stage {
            Stage::EmbedBatch => {
                let changed: HashSet<&str> = self.changed.iter().map(|f| f.path.as_str()).collect();
                if let Some(stray) = self.chunks.iter().find(|c| !changed.contains(c.file.path.as_str())) {
                    return Err(PipelineError::InvalidState(format!(
                        "chunk for {} which is not a changed file",
                        stray.file.path
                    )));
                }
            }
            Stage::UpsertVectors => {
                if self.embeddings.len() != self.chunks.len() {
                    return Err(PipelineError::InvalidState(format!(
                        "{} embeddings for {} chunks",
                        self.embeddings.len(),
                        self.chunks.len()
                    )));
                }
                if let Some(first) = self.embeddings.first() {
                    if self.embeddings.iter().any(|e| e.len() != first.len()) {
                        return Err(PipelineError::InvalidState(
                            "embeddings have inconsistent dimensions".to_string(),
                        ));
                    }
                }
            }
            Stage::CommitRun => {
                let changed: HashSet<&str> = self.changed.iter().map(|f| f.path.as_str()).collect();
                if let Some(stray) = self.upserted_paths.iter().find(|p| !changed.contains(p.as_str())) {
                    return Err(PipelineError::InvalidState(format!(
                        "upserted path {} is not a changed file",
                        stray
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Terminal result of an indexing run.
#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub run_id: String,
    pub stats: RunStats,
    /// Per-file issues; serialized as their string form.
    #[serde(serialize_with = "issues_as_strings")]
    pub errors: Vec<RunIssue>,
}

fn issues_as_strings<S: Serializer>(issues: &[RunIssue], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(issues.iter().map(|i| i.to_string()))
}

/// Tunables of the indexing pipeline, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub chunking: ChunkingConfig,
    pub batch_size: usize,
    pub concurrency: usize,
    pub workers: usize,
    /// Deadline for one embedding batch, provider retries included.
    pub embed_timeout: Duration,
    pub index_timeout: Duration,
}

impl IndexSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: config.chunking.clone(),
            batch_size: config.embedding.batch_size.max(1),
            concurrency: config.embedding.concurrency.max(1),
            workers: config.index.workers.max(1),
            embed_timeout: config.embedding.batch_timeout(),
            index_timeout: config.retrieval.timeout(),
        }
    }
}

pub struct IndexPipeline {
    discoverer: Discoverer,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    ledger: Ledger,
    checkpoints: CheckpointStore,
    settings: IndexSettings,
}

impl IndexPipeline {
    pub fn new(
        discoverer: Discoverer,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        ledger: Ledger,
        checkpoints: CheckpointStore,
        settings: IndexSettings,
    ) -> Self {
        Self {
            discoverer,
            embedder,
            index,
            ledger,
            checkpoints,
            settings,
        }
    }

    /// Runs (or resumes) an indexing run to completion.
    ///
    /// With `run_id` naming an unfinished run, the stored state and request
    /// are used and `request` is ignored. A finished, unknown or absent run id
    /// starts a clean run; without one a new id is generated.
    pub async fn run(&self, request: &IndexRequest, run_id: Option<&str>) -> Result<IndexOutcome, StageFailure> {
        let (mut state, mut stage) = self.start_or_resume(request, run_id).await?;
        let embedder = self
            .embedder_for(&state.model)
            .map_err(|source| StageFailure { stage, source })?;
        let run_started = Instant::now();

        while stage != Stage::Done {
            let started = Instant::now();
            debug!(run_id = %state.run_id, %stage, "stage started");

            self.run_stage(stage, &mut state, embedder.as_ref())
                .await
                .map_err(|source| StageFailure { stage, source })?;
            state.compact_after(stage);
            self.checkpoints
                .save(&state.run_id, PIPELINE, stage, &state)
                .await
                .map_err(|source| StageFailure { stage, source })?;

            info!(
                run_id = %state.run_id,
                %stage,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stage completed"
            );
            stage = stage.next();
        }

        self.checkpoints
            .save(&state.run_id, PIPELINE, Stage::Done, &state)
            .await
            .map_err(|source| StageFailure {
                stage: Stage::Done,
                source,
            })?;

        info!(
            run_id = %state.run_id,
            discovered = state.stats.discovered,
            changed = state.stats.changed,
            chunks = state.stats.chunks,
            committed = state.stats.committed,
            issues = state.errors.len(),
            elapsed_ms = run_started.elapsed().as_millis() as u64,
            "index run finished"
        );

        Ok(IndexOutcome {
            run_id: state.run_id,
            stats: state.stats,
            errors: state.errors,
        })
    }

    async fn start_or_resume(
        &self,
        request: &IndexRequest,
        run_id: Option<&str>,
    ) -> Result<(RunState, Stage), StageFailure> {
        if let Some(id) = run_id {
            let stored = self
                .checkpoints
                .load::<RunState>(id)
                .await
                .map_err(|source| StageFailure {
                    stage: Stage::Discover,
                    source,
                })?;
            match stored {
                Some((last, state)) if last != Stage::Done => {
                    let next = last.next();
                    info!(run_id = id, completed = %last, resume_at = %next, "resuming index run");
                    return Ok((state, next));
                }
                Some(_) => info!(run_id = id, "run already finished, starting it again"),
                None => debug!(run_id = id, "no checkpoint for run id, starting fresh"),
            }
        }

        let run_id = run_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.embedder.model_name().to_string());
        info!(run_id = %run_id, mode = %request.mode, model = %model, "starting index run");
        Ok((RunState::new(run_id, request, model), Stage::Discover))
    }

    fn embedder_for(&self, model: &str) -> Result<Arc<dyn EmbeddingProvider>, PipelineError> {
        if model == self.embedder.model_name() {
            return Ok(Arc::clone(&self.embedder));
        }
        Ok(self.embedder.with_model(model)?)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        state: &mut RunState,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<(), PipelineError> {
        state.validate_for(stage)?;
        match stage {
            Stage::Discover => self.discover(state).await,
            Stage::Diff => self.diff(state).await,
            Stage::ParseAndChunk => self.parse_and_chunk(state).await,
            Stage::EmbedBatch => self.embed_batch(state, embedder).await,
            Stage::UpsertVectors => self.upsert_vectors(state).await,
            Stage::CommitRun => self.commit_run(state).await,
            other => Err(PipelineError::InvalidState(format!(
                "{} is not an indexing stage",
                other
            ))),
        }
    }

    async fn discover(&self, state: &mut RunState) -> Result<(), PipelineError> {
        let found = self.discoverer.discover(&state.roots).await?;
        state.stats.discovered = found.files.len();
        state.errors.extend(found.issues);
        state.files = found.files;
        Ok(())
    }

    async fn diff(&self, state: &mut RunState) -> Result<(), PipelineError> {
        let known = self.ledger.known_fingerprints().await?;
        state.changed = select_changed(&state.files, &known, state.mode, state.force_reembed);
        state.stats.changed = state.changed.len();
        Ok(())
    }

    async fn parse_and_chunk(&self, state: &mut RunState) -> Result<(), PipelineError> {
        let target = self.settings.chunking.target_tokens;
        let overlap = self.settings.chunking.overlap_tokens;

        let results: Vec<Result<Vec<Chunk>, RunIssue>> = stream::iter(state.changed.clone())
            .map(|file| async move {
                let path = file.path.clone();
                tokio::task::spawn_blocking(move || parse_and_chunk_file(file, target, overlap))
                    .await
                    .unwrap_or_else(|e| {
                        Err(RunIssue::ParseFailure {
                            path,
                            detail: format!("parser task failed: {}", e),
                        })
                    })
            })
            .buffered(self.settings.workers)
            .collect()
            .await;

        let mut chunks = Vec::new();
        let mut skipped = 0;
        for result in results {
            match result {
                Ok(file_chunks) => chunks.extend(file_chunks),
                Err(issue) => {
                    warn!(path = %issue.path(), issue = %issue, "skipping file");
                    skipped += 1;
                    state.errors.push(issue);
                }
            }
        }
        debug!(files = state.changed.len() - skipped, chunks = chunks.len(), "chunked");

        state.stats.chunks = chunks.len();
        state.stats.skipped = skipped;
        state.chunks = chunks;
        Ok(())
    }

    async fn embed_batch(&self, state: &mut RunState, embedder: &dyn EmbeddingProvider) -> Result<(), PipelineError> {
        if state.chunks.is_empty() {
            state.embeddings = Vec::new();
            return Ok(());
        }

        let timeout = self.settings.embed_timeout;
        let batches: Vec<Vec<String>> = state
            .chunks
            .chunks(self.settings.batch_size)
            .map(|batch| batch.iter().map(|c| c.text.clone()).collect())
            .collect();
        let batch_count = batches.len();

        let embedded: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|texts| async move {
                let vectors = tokio::time::timeout(timeout, embedder.embed(&texts))
                    .await
                    .map_err(|_| EmbedError::Timeout(timeout))??;
                if vectors.len() != texts.len() {
                    return Err(PipelineError::InvalidState(format!(
                        "embedder returned {} vectors for {} texts",
                        vectors.len(),
                        texts.len()
                    )));
                }
                Ok(vectors)
            })
            .buffered(self.settings.concurrency)
            .try_collect()
            .await?;

        state.embeddings = embedded.into_iter().flatten().collect();
        debug!(batches = batch_count, vectors = state.embeddings.len(), "embedded");
        Ok(())
    }

    async fn upsert_vectors(&self, state: &mut RunState) -> Result<(), PipelineError> {
        let mut by_path: Vec<(String, Vec<VectorRecord>)> = Vec::new();
        for (chunk, embedding) in state.chunks.iter().zip(state.embeddings.iter()) {
            let record = VectorRecord::from_chunk(chunk, embedding.clone(), &state.model);
            match by_path.last_mut() {
                Some((path, records)) if *path == chunk.file.path => records.push(record),
                _ => by_path.push((chunk.file.path.clone(), vec![record])),
            }
        }

        let already: HashSet<String> = state.upserted_paths.iter().cloned().collect();
        for (path, records) in by_path {
            if already.contains(&path) {
                continue;
            }
            self.with_index_timeout("vector upsert", self.index.upsert(&records))
                .await?;

            let keep: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            let stale = self
                .with_index_timeout("stale vector pruning", self.index.retain_for_path(&path, &keep))
                .await?;
            if stale > 0 {
                debug!(path = %path, stale, "removed stale vectors");
            }

            state.stats.upserted += records.len();
            state.stats.stale_vectors += stale;
            state.upserted_paths.push(path);
        }
        Ok(())
    }

    async fn commit_run(&self, state: &mut RunState) -> Result<(), PipelineError> {
        let indexed_at = chrono::Utc::now().to_rfc3339();
        let upserted: HashSet<&str> = state.upserted_paths.iter().map(String::as_str).collect();

        let mut committed = 0;
        for file in state.changed.iter().filter(|f| upserted.contains(f.path.as_str())) {
            self.ledger
                .upsert_file(&LedgerFileRecord::from_descriptor(file, &indexed_at))
                .await?;
            committed += 1;
        }
        state.stats.committed = committed;

        if state.prune_missing {
            let pruned = self.prune_missing(state).await?;
            state.stats.pruned = pruned;
        }
        Ok(())
    }

    /// Removes ledger rows and vectors of files under the run's roots that
    /// discovery no longer sees. Roots that are missing are left alone.
    async fn prune_missing(&self, state: &RunState) -> Result<usize, PipelineError> {
        let present: HashSet<&str> = state.files.iter().map(|f| f.path.as_str()).collect();
        let roots: Vec<&PathBuf> = state.roots.iter().filter(|r| r.exists()).collect();

        let mut pruned = 0;
        for record in self.ledger.list_files().await? {
            let path = Path::new(&record.path);
            if present.contains(record.path.as_str()) || !roots.iter().any(|r| path.starts_with(r)) {
                continue;
            }
            self.with_index_timeout("vector delete", self.index.delete_path(&record.path))
                .await?;
            self.ledger.delete_file(&record.path).await?;
            info!(path = %record.path, "pruned missing file");
            pruned += 1;
        }
        Ok(pruned)
    }

    async fn with_index_timeout<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, PipelineError> {
        let after = self.settings.index_timeout;
        tokio::time::timeout(after, fut)
            .await
            .map_err(|_| PipelineError::Timeout { operation, after })?
            .map_err(|e| PipelineError::IndexUnavailable(format!("{:#}", e)))
    }
}

/// Parses one file and splits it into chunks. Runs on the blocking pool.
fn parse_and_chunk_file(file: FileDescriptor, target: usize, overlap: usize) -> Result<Vec<Chunk>, RunIssue> {
    let document = parse_document(Path::new(&file.path))?;
    let spans = chunk_text(&document.text, target, overlap).map_err(|e| RunIssue::ParseFailure {
        path: file.path.clone(),
        detail: format!("chunking failed: {:#}", e),
    })?;
    if spans.is_empty() {
        return Err(RunIssue::EmptyContent { path: file.path });
    }

    Ok(spans
        .into_iter()
        .enumerate()
        .map(|(chunk_index, span)| Chunk {
            file: file.clone(),
            chunk_index,
            char_start: span.char_start,
            char_end: span.char_end,
            text: span.text,
        })
        .collect())
}
