//! Library entry points: sync a corpus, search it, query arbitrary sources,
//! and find orphaned per-document artifacts.
//!
//! [`CorpusIndex`] owns the process-wide services (embedder, document loader,
//! hot cache, progress reporter) and hands them to the merge and query
//! layers. It is cheap to clone.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::aggregate::{aggregate, AggregatedResult};
use crate::artifact::{self, NESTED_INDEX_DIR};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{IndexError, Result};
use crate::hot_cache::HotCache;
use crate::loader::{DocumentLoader, FileLoader};
use crate::lock::CorpusLock;
use crate::manifest::{CorpusScanner, Manifest, ScanOptions};
use crate::merge::{CorpusState, MergeOptions, MergeOrchestrator, MergeReport};
use crate::hashing::is_content_hash;
use crate::per_doc::{self, CachedDocument, OrphanCleanup, OrphanSet};
use crate::progress::{NoProgress, ProgressReporter};
use crate::query::{ArtifactLoader, QueryCoordinator, QueryOptions, SourceResult};

/// Which artifacts a corpus search reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    /// The merged aggregate artifact.
    #[default]
    Aggregate,
    /// Every per-document artifact, fanned out.
    PerDocument,
}

#[derive(Clone)]
pub struct CorpusIndex {
    config: Config,
    embedder: Arc<dyn Embedder>,
    loader: Arc<dyn DocumentLoader>,
    hot_cache: HotCache,
    progress: Arc<dyn ProgressReporter>,
}

impl CorpusIndex {
    /// Validate `config` and construct the shared services it describes.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let embedder = create_embedder(&config.embedding)?;
        let loader: Arc<dyn DocumentLoader> = Arc::new(FileLoader::new(&config.chunking));
        Ok(Self::with_services(config, loader, embedder))
    }

    pub fn with_services(
        config: Config,
        loader: Arc<dyn DocumentLoader>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let hot_cache = HotCache::from_config(&config.cache);
        Self {
            config,
            embedder,
            loader,
            hot_cache,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_hot_cache(mut self, hot_cache: HotCache) -> Self {
        self.hot_cache = hot_cache;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hot_cache(&self) -> &HotCache {
        &self.hot_cache
    }

    fn orchestrator(&self) -> MergeOrchestrator {
        MergeOrchestrator::new(self.config.clone(), self.loader.clone(), self.embedder.clone())
            .with_progress(self.progress.clone())
    }

    /// Bring the per-document artifacts and the aggregate up to date.
    /// Blocking; async callers go through `spawn_blocking`.
    pub fn sync_corpus(&self, corpus_dir: &Path, options: &MergeOptions) -> Result<MergeReport> {
        self.orchestrator().sync(corpus_dir, options)
    }

    /// [`sync_corpus`](Self::sync_corpus) on the blocking pool.
    pub async fn sync_corpus_async(&self, corpus_dir: &Path, options: MergeOptions) -> Result<MergeReport> {
        let this = self.clone();
        let dir = corpus_dir.to_path_buf();
        tokio::task::spawn_blocking(move || this.sync_corpus(&dir, &options))
            .await
            .map_err(|e| IndexError::Merge(format!("sync task failed: {e}")))?
    }

    /// Answer `query` from a corpus, syncing first when no aggregate exists
    /// or a rebuild is forced.
    pub async fn search_corpus(
        &self,
        corpus_dir: &Path,
        query: &str,
        top_k: Option<usize>,
        force_rebuild: bool,
        scope: SearchScope,
    ) -> Result<AggregatedResult> {
        let started = Instant::now();
        let read_only = self.config.corpus.is_read_only(corpus_dir);
        let mut force = force_rebuild;
        if force && read_only {
            tracing::warn!(corpus = %corpus_dir.display(), "read-only corpus, ignoring forced rebuild");
            force = false;
        }

        let aggregate_dir = self.config.corpus.aggregate_dir(corpus_dir);
        if force {
            self.sync_corpus_async(
                corpus_dir,
                MergeOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await?;
        } else if !artifact::is_valid_dir(&aggregate_dir) {
            if read_only {
                return Err(IndexError::NotFound(format!(
                    "read-only corpus {} has no aggregate index",
                    corpus_dir.display()
                )));
            }
            tracing::info!(corpus = %corpus_dir.display(), "no aggregate index yet, syncing");
            self.sync_corpus_async(corpus_dir, MergeOptions::default()).await?;
        } else {
            let plan = self
                .sync_corpus_async(
                    corpus_dir,
                    MergeOptions {
                        dry_run: true,
                        ..Default::default()
                    },
                )
                .await?;
            if plan.state != CorpusState::Unchanged {
                tracing::warn!(
                    corpus = %corpus_dir.display(),
                    changes = %plan.delta.summary(),
                    "corpus changed since the last merge; results come from the existing index"
                );
            }
        }

        let sources = match scope {
            SearchScope::Aggregate => {
                if aggregate_dir == corpus_dir.join(NESTED_INDEX_DIR) {
                    vec![corpus_dir.to_path_buf()]
                } else {
                    vec![aggregate_dir]
                }
            }
            SearchScope::PerDocument => self.per_document_sources(corpus_dir)?,
        };
        if sources.is_empty() {
            return Err(IndexError::NotFound(format!(
                "no per-document artifacts in {}",
                corpus_dir.display()
            )));
        }

        let mut options = QueryOptions::from_config(&self.config.query);
        if let Some(k) = top_k {
            options.top_k = k;
        }
        let results = self.run_query(&sources, query, &options, false).await?;
        Ok(aggregate(query, &results, started.elapsed()))
    }

    /// Query arbitrary artifact directories.
    pub async fn query_sources(
        &self,
        sources: &[PathBuf],
        query: &str,
        options: &QueryOptions,
        bypass_cache: bool,
    ) -> Result<AggregatedResult> {
        let started = Instant::now();
        let results = self.run_query(sources, query, options, bypass_cache).await?;
        Ok(aggregate(query, &results, started.elapsed()))
    }

    /// Run each query in turn against the same sources, one aggregated
    /// result per query in input order.
    pub async fn query_batch(
        &self,
        sources: &[PathBuf],
        queries: &[String],
        options: &QueryOptions,
        bypass_cache: bool,
    ) -> Result<Vec<AggregatedResult>> {
        let mut results = Vec::with_capacity(queries.len());
        for (n, query) in queries.iter().enumerate() {
            tracing::info!(n = n + 1, total = queries.len(), sources = sources.len(), "running query");
            results.push(self.query_sources(sources, query, options, bypass_cache).await?);
        }
        Ok(results)
    }

    async fn run_query(
        &self,
        sources: &[PathBuf],
        query: &str,
        options: &QueryOptions,
        bypass_cache: bool,
    ) -> Result<Vec<SourceResult>> {
        let loader = ArtifactLoader::new(self.hot_cache.clone()).bypass_cache(bypass_cache);
        QueryCoordinator::new(self.embedder.clone(), Arc::new(loader))
            .with_progress(self.progress.clone())
            .query(sources, query, options)
            .await
    }

    /// Per-document artifacts tracked by the corpus manifest, or every valid
    /// hash folder when the manifest tracks none.
    pub fn per_document_sources(&self, corpus_dir: &Path) -> Result<Vec<PathBuf>> {
        let manifest = Manifest::load(&Manifest::path_in(corpus_dir))?;
        let tracked: Vec<PathBuf> = manifest
            .merge_tracking
            .indexes
            .values()
            .map(|entry| PathBuf::from(&entry.source_path))
            .filter(|dir| artifact::is_valid_dir(dir))
            .collect();
        if !tracked.is_empty() {
            return Ok(tracked);
        }
        Ok(per_doc::list_cached(&self.config.corpus.cache_root(corpus_dir))?
            .into_iter()
            .filter(|doc| doc.valid)
            .map(|doc| doc.dir)
            .collect())
    }

    /// Valid per-document artifacts in the corpus, sorted by content hash.
    pub fn list_sources(&self, corpus_dir: &Path) -> Result<Vec<CachedDocument>> {
        Ok(per_doc::list_cached(&self.config.corpus.cache_root(corpus_dir))?
            .into_iter()
            .filter(|doc| doc.valid)
            .collect())
    }

    /// Per-document artifacts selected by content hash, in the order given.
    ///
    /// Hashes are matched case-insensitively after trimming. Unknown hashes
    /// are logged and skipped; [`IndexError::NotFound`] if none match.
    pub fn sources_by_hash(&self, corpus_dir: &Path, hashes: &[String]) -> Result<Vec<PathBuf>> {
        let cache_root = self.config.corpus.cache_root(corpus_dir);
        let mut selected: Vec<PathBuf> = Vec::new();
        for raw in hashes {
            let hash = raw.trim().to_ascii_lowercase();
            if !is_content_hash(&hash) {
                return Err(IndexError::InvalidInput(format!(
                    "'{}' is not a 32-character content hash",
                    raw.trim()
                )));
            }
            let dir = cache_root.join(&hash);
            if !artifact::is_valid_dir(&dir) {
                tracing::warn!(hash = %hash, corpus = %corpus_dir.display(), "no artifact for hash, skipping");
                continue;
            }
            if !selected.contains(&dir) {
                selected.push(dir);
            }
        }
        if selected.is_empty() {
            return Err(IndexError::NotFound(format!(
                "no per-document artifacts in {} match the given hashes",
                corpus_dir.display()
            )));
        }
        Ok(selected)
    }

    /// Hash folders whose document is no longer in the corpus. Reads only.
    pub fn find_orphans(&self, corpus_dir: &Path) -> Result<OrphanSet> {
        let manifest = Manifest::load(&Manifest::path_in(corpus_dir))?;
        let scanner = CorpusScanner::from_config(&self.config)?;
        let scan = scanner.scan(corpus_dir, &manifest, &ScanOptions::default())?;

        let mut live: BTreeSet<String> = scan
            .documents
            .iter()
            .map(|d| d.content_hash.clone())
            .collect();
        // A file that exists but could not be read this time is not gone.
        for (name, _) in &scan.failures {
            if let Some(state) = manifest.files.get(name) {
                live.insert(state.content_hash.clone());
            }
        }
        per_doc::find_orphans(&self.config.corpus.cache_root(corpus_dir), &live)
    }

    /// Find and delete orphans under the corpus lock. More than
    /// `merge.orphan_confirm_threshold` folders need `confirmed`.
    pub fn remove_orphans(&self, corpus_dir: &Path, confirmed: bool) -> Result<(OrphanSet, OrphanCleanup)> {
        let _lock = CorpusLock::acquire(corpus_dir)?;
        let orphans = self.find_orphans(corpus_dir)?;
        let cleanup = orphans.remove(confirmed, self.config.merge.orphan_confirm_threshold)?;
        Ok((orphans, cleanup))
    }
}
