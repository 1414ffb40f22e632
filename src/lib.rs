//! # corpus-index
//!
//! Local semantic indexing and retrieval over a directory tree.
//!
//! Files under the configured roots are discovered, fingerprinted, parsed
//! into text, split into overlapping token windows, embedded, and stored in a
//! vector collection. A SQLite ledger records what was indexed, and audits
//! every query with its ranked hits.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │ Discoverer │──▶│ Index pipeline        │──▶│ Vector index │
//! │ walk+hash  │   │ diff/parse/chunk/embed│   │ (SQLite)     │
//! └────────────┘   └──────────┬───────────┘   └──────┬───────┘
//!                             ▼                      │
//!                       ┌──────────┐          ┌──────┴───────┐
//!                       │  Ledger  │◀─────────│ Query        │
//!                       │ (SQLite) │  audit   │ pipeline     │
//!                       └──────────┘          └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cidx init                       # create the databases
//! cidx index --root ./docs        # incremental run
//! cidx index --full --prune       # re-process everything, drop deleted files
//! cidx search "write ahead log" --top-k 5
//! cidx stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`fingerprint`] | SHA-256 content hashing |
//! | [`discover`] | Root walking and file description |
//! | [`diff`] | Change detection against the ledger |
//! | [`extract`] | Text extraction (plain text, PDF, DOCX, PPTX) |
//! | [`chunk`] | Token-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Vector index abstraction and backends |
//! | [`ledger`] | Files, queries and audit tables |
//! | [`checkpoint`] | Per-run pipeline checkpoints |
//! | [`pipeline`] | Indexing and query state machines |
//! | [`engine`] | Wiring for the CLI and embedding applications |
//! | [`db`] | Database connection |
//! | [`migrate`] | Ledger schema |

pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod db;
pub mod diff;
pub mod discover;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod store;
