//! # Corpus Index CLI (`cidx`)
//!
//! The `cidx` binary keeps a directory of documents indexed: one vector
//! artifact per document, merged into a single aggregate that is searched,
//! plus an ephemeral hot cache of loaded artifacts.
//!
//! ## Usage
//!
//! ```bash
//! cidx --config ./config/cidx.toml --corpus ./papers <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cidx sync` | Build missing per-document artifacts and re-merge the aggregate if needed |
//! | `cidx search "<query>"` | Search a corpus, syncing first when it has no aggregate |
//! | `cidx query "<query>" --source <dir>...` | Fan a query out over arbitrary artifact directories |
//! | `cidx query --list-sources` | List per-document artifacts and their content hashes |
//! | `cidx orphans` | Find and delete per-document artifacts with no live document |
//! | `cidx cache list\|stats\|sweep\|clear` | Inspect or clean the per-document and hot caches |
//! | `cidx status` | Summarize what is on disk for a corpus |
//!
//! ## Examples
//!
//! ```bash
//! # See what changed without writing anything
//! cidx sync --corpus ./papers --dry-run
//!
//! # Force batch merging in groups of 50
//! cidx sync --corpus ./papers --batch-size 50
//!
//! # Search, JSON output
//! cidx search "attention heads" --corpus ./papers --format json
//!
//! # Query three corpora at once with two workers
//! cidx query "tokenizer" --source ./a --source ./b --source ./c --workers 2
//!
//! # Run a batch of queries over two documents and keep the JSON results
//! cidx query --corpus ./papers --batch-file queries.json \
//!     --source-hashes 838cc6ac8cb0d8ddb98fdb1ae0c8a443,41d80961ba66da6a1294aa9624cea15d \
//!     --output-dir ./results
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use corpus_index::commands;
use corpus_index::config;
use corpus_index::corpus::CorpusIndex;
use corpus_index::merge::MergeOptions;
use corpus_index::progress::ProgressMode;
use corpus_index::stats;
use corpus_index::QueryBatch;

const DEFAULT_CONFIG: &str = "./config/cidx.toml";

/// Corpus Index CLI: incremental per-document vector indexes with atomic
/// merges and parallel querying.
///
/// All commands accept `--config` and `--corpus`. A missing config file at
/// the default location means built-in defaults.
#[derive(Parser)]
#[command(
    name = "cidx",
    about = "Corpus Index: incremental per-document vector indexes with atomic merges and parallel querying",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/cidx.toml`; if that file does not exist the
    /// built-in defaults are used. `CIDX_*` environment variables override
    /// individual settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Corpus directory. Overrides `[corpus].dir`.
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Bring per-document artifacts and the aggregate up to date.
    ///
    /// Detects added, modified, and removed documents by content hash,
    /// builds artifacts only for new content, and re-merges the aggregate
    /// when the set of contributing artifacts changed. The aggregate is
    /// swapped in atomically with the previous one kept as a backup.
    Sync {
        /// Report what would change without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Merge in batches of this size regardless of corpus size.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only consider the first N documents.
        #[arg(long)]
        limit: Option<usize>,

        /// Merge even when nothing changed.
        #[arg(long)]
        force: bool,

        /// Rebuild every per-document artifact.
        #[arg(long)]
        rebuild_documents: bool,

        /// Rehash every document instead of trusting size and mtime.
        #[arg(long)]
        rehash: bool,

        /// Write the aggregate in place (unsafe: a crash leaves it half-written).
        #[arg(long)]
        no_atomic: bool,

        /// Keep intermediate batch artifacts for inspection.
        #[arg(long)]
        keep_batches: bool,
    },

    /// Search a corpus.
    ///
    /// Syncs first when the corpus has no aggregate yet. When changes are
    /// detected without `--force-rebuild`, a warning is logged and the
    /// existing aggregate answers.
    Search {
        /// The search query string.
        query: String,

        /// Number of chunks to retrieve per source.
        #[arg(long)]
        top_k: Option<usize>,

        /// Fan out over every per-document artifact instead of the aggregate.
        #[arg(long)]
        per_document: bool,

        /// Re-merge before searching.
        #[arg(long)]
        force_rebuild: bool,

        /// Output format: `markdown` or `json`.
        #[arg(long, default_value = "markdown")]
        format: String,
    },

    /// Query artifact directories in parallel.
    ///
    /// Each source is searched in isolation with its own timeout; a failed
    /// or slow source is reported without affecting the others. Sources are
    /// given as directories, as per-document content hashes of `--corpus`,
    /// or both.
    Query {
        /// The search query string. Omit when using `--batch-file` or `--list-sources`.
        #[arg(required_unless_present_any = ["batch_file", "list_sources"])]
        query: Option<String>,

        /// Artifact directory (containing `index.*` or `.mini_rag_index/`).
        #[arg(long = "source")]
        sources: Vec<PathBuf>,

        /// Comma-separated content hashes of per-document artifacts in the corpus.
        #[arg(long, value_delimiter = ',')]
        source_hashes: Vec<String>,

        /// JSON file with `queries` and optional `external_sources`.
        #[arg(long, conflicts_with = "query")]
        batch_file: Option<PathBuf>,

        /// List per-document artifacts with their hashes and exit.
        #[arg(long)]
        list_sources: bool,

        /// Save each result as JSON in this directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Maximum concurrent sources.
        #[arg(long)]
        workers: Option<usize>,

        /// Per-source timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Number of chunks to retrieve per source.
        #[arg(long)]
        top_k: Option<usize>,

        /// Bypass the hot cache for loads and saves.
        #[arg(long)]
        no_cache: bool,

        /// Output format: `markdown` or `json`.
        #[arg(long, default_value = "markdown")]
        format: String,
    },

    /// Find per-document artifacts whose document no longer exists.
    Orphans {
        /// List orphans without deleting them.
        #[arg(long)]
        dry_run: bool,

        /// Confirm deletion of a large number of folders.
        #[arg(long)]
        yes: bool,
    },

    /// Inspect and clean caches.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Summarize tracked documents, artifacts, backups, and the hot cache.
    Status,
}

/// Cache subcommands.
#[derive(Subcommand)]
enum CacheAction {
    /// List per-document artifacts in the corpus.
    List,
    /// Show hot cache entry counts and store usage.
    Stats,
    /// Remove hot cache entries older than the TTL.
    Sweep,
    /// Remove every hot cache entry.
    Clear {
        /// Confirm deletion.
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("corpus_index=info,cidx=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            default.exists().then_some(default)
        }
    };
    let mut cfg = config::load_config(config_path.as_deref())?;
    if let Some(corpus) = &cli.corpus {
        cfg.corpus.dir = corpus.clone();
    }
    let corpus_dir = cfg.corpus.dir.clone();

    let progress = if cli.log_json {
        ProgressMode::Json
    } else {
        ProgressMode::default_for_tty()
    };
    let index = CorpusIndex::new(cfg)
        .context("Failed to initialize")?
        .with_progress(progress.reporter());

    match cli.command {
        Commands::Sync {
            dry_run,
            batch_size,
            limit,
            force,
            rebuild_documents,
            rehash,
            no_atomic,
            keep_batches,
        } => {
            let options = MergeOptions {
                dry_run,
                batch_size,
                limit,
                force,
                rebuild_documents,
                atomic: no_atomic.then_some(false),
                keep_batches,
                force_rehash: rehash,
            };
            commands::run_sync(&index, &corpus_dir, options).await?;
        }
        Commands::Search {
            query,
            top_k,
            per_document,
            force_rebuild,
            format,
        } => {
            commands::run_search(
                &index,
                &corpus_dir,
                &query,
                top_k,
                per_document,
                force_rebuild,
                &format,
            )
            .await?;
        }
        Commands::Query {
            query,
            sources,
            source_hashes,
            batch_file,
            list_sources,
            output_dir,
            workers,
            timeout,
            top_k,
            no_cache,
            format,
        } => {
            if list_sources {
                commands::run_list_sources(&index, &corpus_dir, &format)?;
                return Ok(());
            }
            let mut request = commands::QueryRequest {
                queries: query.into_iter().collect(),
                sources,
                source_hashes,
                workers,
                timeout_secs: timeout,
                top_k,
                no_cache,
                output_dir,
            };
            if let Some(path) = batch_file {
                let batch = QueryBatch::load(&path)
                    .with_context(|| format!("Failed to read batch file {}", path.display()))?;
                request.queries = batch.queries;
                request.sources.extend(batch.external_sources);
            }
            commands::run_query(&index, &corpus_dir, &request, &format).await?;
        }
        Commands::Orphans { dry_run, yes } => {
            commands::run_orphans(&index, &corpus_dir, dry_run, yes)?;
        }
        Commands::Cache { action } => match action {
            CacheAction::List => commands::run_cache_list(index.config(), &corpus_dir)?,
            CacheAction::Stats => commands::run_cache_stats(index.hot_cache())?,
            CacheAction::Sweep => commands::run_cache_sweep(index.hot_cache())?,
            CacheAction::Clear { yes } => commands::run_cache_clear(index.hot_cache(), yes)?,
        },
        Commands::Status => {
            stats::run_status(index.config(), &corpus_dir, index.hot_cache())?;
        }
    }

    Ok(())
}
