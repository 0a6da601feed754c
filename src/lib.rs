//! # Corpus Index
//!
//! Incremental vector indexing for a directory of documents.
//!
//! Every document gets its own index artifact, stored under a folder named by
//! the document's content hash, so unchanged content is never re-embedded.
//! The per-document artifacts are merged into one aggregate per corpus; a
//! manifest records which artifacts contributed so a merge runs only when
//! that set changes. Aggregates are replaced atomically with a timestamped
//! backup of the previous contents. Queries fan out across sources with a
//! bounded worker pool and per-source timeouts, and results are deduplicated
//! by content.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Corpus  │──▶│   Manifest   │──▶│ Per-document │──▶│    Batch    │
//! │  files   │   │ hash + delta │   │   artifacts  │   │    merge    │
//! └──────────┘   └──────────────┘   └──────────────┘   └──────┬──────┘
//!                                                             │ atomic
//!                                                             ▼ replace
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Results  │◀──│  Aggregate   │◀──│    Query     │◀──│  Aggregate  │
//! │ md/json  │   │    dedup     │   │  fan-out     │   │  + hot cache│
//! └──────────┘   └──────────────┘   └──────────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cidx sync --corpus ./papers           # build artifacts, merge
//! cidx search "attention" --corpus ./papers
//! cidx orphans --corpus ./papers --dry-run
//! cidx status --corpus ./papers
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, `CIDX_*` overrides, validation |
//! | [`error`] | Error taxonomy and [`error::ErrorKind`] |
//! | [`hashing`] | Chunked content hashing and the concatenated hash |
//! | [`manifest`] | Corpus manifest, migration, and change detection |
//! | [`models`] | Core data types |
//! | [`chunk`] | Text chunking |
//! | [`loader`] | Document loading (text, markdown, PDF) |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`artifact`] | On-disk flat vector index |
//! | [`per_doc`] | Per-document artifact cache and orphan cleanup |
//! | [`hot_cache`] | Ephemeral cache of loaded artifacts |
//! | [`atomic`] | Atomic directory replacement with backups |
//! | [`batch`] | Sequential and multi-level batch merging |
//! | [`lock`] | Single-writer corpus lock |
//! | [`merge`] | Sync orchestration |
//! | [`query`] | Parallel per-source querying |
//! | [`aggregate`] | Result deduplication and rendering |
//! | [`corpus`] | Library entry points |
//! | [`progress`] | Progress reporting |
//! | [`stats`] | `cidx status` |
//! | [`commands`] | `cidx` command handlers |

pub mod aggregate;
pub mod artifact;
pub mod atomic;
pub mod batch;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod fsutil;
pub mod hashing;
pub mod hot_cache;
pub mod loader;
pub mod lock;
pub mod manifest;
pub mod merge;
pub mod models;
pub mod per_doc;
pub mod progress;
pub mod query;
pub mod stats;

pub use aggregate::{AggregatedChunk, AggregatedResult};
pub use config::Config;
pub use corpus::{CorpusIndex, SearchScope};
pub use error::{ErrorKind, IndexError, Result};
pub use merge::{MergeOptions, MergeReport};
pub use query::{QueryBatch, QueryOptions, SourceError, SourceResult};
