//! # corpus-index CLI (`cidx`)
//!
//! ## Usage
//!
//! ```bash
//! cidx --config ./config/cidx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cidx init` | Create the ledger, vector and checkpoint databases |
//! | `cidx index` | Index the configured roots (incremental by default) |
//! | `cidx search "<query>"` | Rank indexed chunks against a query |
//! | `cidx stats` | Ledger counts, vector count and recent runs |
//!
//! Reports go to stdout; logs go to stderr and are filtered with `RUST_LOG`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use corpus_index::config;
use corpus_index::diff::IndexMode;
use corpus_index::engine::{Engine, SearchRequest};
use corpus_index::pipeline::IndexRequest;
use corpus_index::store::MetadataFilter;

/// corpus-index: local semantic indexing and retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cidx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cidx",
    about = "Local semantic indexing and retrieval over a directory tree",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cidx.toml")]
    config: PathBuf,

    /// Print results as JSON instead of a text report.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the databases and schema. Safe to run repeatedly.
    Init,

    /// Discover, parse, chunk and embed files under the roots.
    Index {
        /// Re-process every discovered file, not only changed ones.
        #[arg(long)]
        full: bool,

        /// Re-embed even when fingerprints are unchanged.
        #[arg(long)]
        force: bool,

        /// Remove ledger rows and vectors of files that no longer exist.
        #[arg(long)]
        prune: bool,

        /// Root to index; repeatable. Defaults to `index.roots`.
        #[arg(long = "root")]
        roots: Vec<PathBuf>,

        /// Embedding model override.
        #[arg(long)]
        model: Option<String>,

        /// Run id; resumes the run when it did not finish.
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Search indexed chunks.
    Search {
        query: String,

        /// User id recorded with the query.
        #[arg(long, default_value = "anonymous")]
        user: String,

        /// Number of hits. Defaults to `retrieval.top_k`.
        #[arg(long)]
        top_k: Option<usize>,

        /// Metadata equality filter, `key=value`; repeatable.
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, serde_json::Value)>,
    },

    /// Show ledger and index statistics.
    Stats,
}

/// `key=value`, with the value read as JSON when it parses and as a plain
/// string otherwise.
fn parse_filter(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty filter key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = config::load_config(&cli.config)?;
    let engine = Engine::open(cfg).await?;

    match cli.command {
        Commands::Init => {
            let config = engine.config();
            println!("Initialized:");
            println!("  ledger:      {}", config.storage.ledger_path().display());
            println!("  vectors:     {}", config.storage.vector_path().display());
            println!("  checkpoints: {}", config.storage.checkpoint_path().display());
        }
        Commands::Index {
            full,
            force,
            prune,
            roots,
            model,
            run_id,
        } => {
            let request = IndexRequest {
                mode: if full { IndexMode::Full } else { IndexMode::Incremental },
                roots,
                model,
                force_reembed: force,
                prune_missing: prune,
            };
            let outcome = engine.index(request, run_id.as_deref()).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                let s = &outcome.stats;
                println!("Run {}", outcome.run_id);
                println!("  discovered:    {}", s.discovered);
                println!("  changed:       {}", s.changed);
                println!("  chunks:        {}", s.chunks);
                println!("  upserted:      {}", s.upserted);
                println!("  committed:     {}", s.committed);
                println!("  skipped:       {}", s.skipped);
                println!("  stale vectors: {}", s.stale_vectors);
                println!("  pruned:        {}", s.pruned);
                if !outcome.errors.is_empty() {
                    println!("Issues:");
                    for issue in &outcome.errors {
                        println!("  {}", issue);
                    }
                }
            }
        }
        Commands::Search {
            query,
            user,
            top_k,
            filters,
        } => {
            if query.trim().is_empty() {
                bail!("query must not be empty");
            }
            let filters = if filters.is_empty() {
                None
            } else {
                Some(filters.into_iter().collect::<MetadataFilter>())
            };
            let response = engine
                .search(SearchRequest {
                    user_id: user,
                    query,
                    top_k,
                    filters,
                })
                .await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else if response.hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in response.hits.iter().enumerate() {
                    println!("{}. [{:.3}] {} #{}", i + 1, hit.score, hit.meta.path, hit.meta.chunk_idx);
                    let excerpt: String = hit.text.chars().take(200).collect();
                    println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
                    println!("    id: {}", hit.id);
                    println!();
                }
                println!("query {} in {} ms", response.query_id, response.latency_ms);
            }
        }
        Commands::Stats => {
            let summary = engine.ledger().summary().await.context("Failed to read ledger")?;
            let vectors = engine.index_handle().count().await?;
            let runs = engine.checkpoints().list(5).await?;

            if cli.json {
                let report = serde_json::json!({
                    "ledger": summary,
                    "vectors": vectors,
                    "collection": engine.index_handle().collection(),
                    "recent_runs": runs,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Files:       {} ({} bytes)", summary.files, summary.total_bytes);
                println!(
                    "Last index:  {}",
                    summary.last_indexed_at.as_deref().unwrap_or("never")
                );
                println!(
                    "Vectors:     {} in '{}'",
                    vectors,
                    engine.index_handle().collection()
                );
                println!("Users:       {}", summary.users);
                println!("Queries:     {} ({} hits)", summary.queries, summary.query_hits);
                println!("API events:  {}", summary.api_events);
                if !runs.is_empty() {
                    println!("Recent runs:");
                    for run in runs {
                        println!("  {}  {}  {}  {}", run.updated_at, run.run_id, run.pipeline, run.stage);
                    }
                }
            }
        }
    }

    Ok(())
}
