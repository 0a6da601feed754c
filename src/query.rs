//! Fan-out querying over many artifacts.
//!
//! One query is embedded once, then searched against every source on the
//! blocking pool, at most `max_workers` at a time. Each source gets its own
//! timeout; the whole call is bounded by `timeout × sources`. A failing or
//! slow source becomes a [`SourceResult`] with an error and never aborts the
//! rest.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::artifact::{self, FlatIndex};
use crate::config::QueryConfig;
use crate::embedding::Embedder;
use crate::error::{ErrorKind, IndexError, Result};
use crate::hot_cache::{CacheLookup, HotCache};
use crate::models::RetrievedChunk;
use crate::per_doc::display_name_from_manifest;
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Why a source produced no chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SourceError {
    Timeout { after_secs: f64 },
    NotFound(String),
    Corrupt(String),
    Failed(String),
    /// Still pending when the overall deadline passed.
    Abandoned,
}

impl SourceError {
    pub fn from_index_error(err: &IndexError) -> Self {
        match err.kind() {
            ErrorKind::Miss => SourceError::NotFound(err.to_string()),
            ErrorKind::Corrupt => SourceError::Corrupt(err.to_string()),
            ErrorKind::Fatal => SourceError::Failed(err.to_string()),
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Timeout { after_secs } => write!(f, "timed out after {after_secs:.1}s"),
            SourceError::NotFound(detail) => write!(f, "not found: {detail}"),
            SourceError::Corrupt(detail) => write!(f, "corrupt: {detail}"),
            SourceError::Failed(detail) => write!(f, "failed: {detail}"),
            SourceError::Abandoned => write!(f, "abandoned at overall deadline"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceResult {
    pub source_name: String,
    pub source_path: PathBuf,
    pub chunks: Vec<RetrievedChunk>,
    pub time_taken_secs: f64,
    pub error: Option<SourceError>,
    pub from_cache: bool,
}

impl SourceResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn failed(source_name: String, source_path: PathBuf, error: SourceError, elapsed: Duration) -> Self {
        Self {
            source_name,
            source_path,
            chunks: Vec::new(),
            time_taken_secs: elapsed.as_secs_f64(),
            error: Some(error),
            from_cache: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryOptions {
    pub max_workers: usize,
    pub timeout: Duration,
    pub top_k: usize,
}

impl QueryOptions {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            timeout: Duration::from_secs(config.timeout_secs),
            top_k: config.top_k,
        }
    }
}

/// Several queries run against the same sources, as read from a batch file:
///
/// ```json
/// { "queries": ["What is SOLID?", "Clean code"], "external_sources": ["/data/books"] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryBatch {
    pub queries: Vec<String>,
    /// Artifact directories queried in addition to any given on the command line.
    #[serde(default)]
    pub external_sources: Vec<PathBuf>,
}

impl QueryBatch {
    pub fn parse(json: &str) -> Result<Self> {
        let batch: Self = serde_json::from_str(json)?;
        if batch.queries.is_empty() {
            return Err(IndexError::InvalidInput("batch has no queries".into()));
        }
        if let Some(n) = batch.queries.iter().position(|q| q.trim().is_empty()) {
            return Err(IndexError::InvalidInput(format!("batch query {} is blank", n + 1)));
        }
        Ok(batch)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                IndexError::NotFound(format!("batch file {}", path.display()))
            }
            _ => err.into(),
        })?;
        Self::parse(&text)
    }
}

/// Searches one source. Blocking; the coordinator runs it off the executor.
pub trait SourceSearch: Send + Sync {
    /// Top `top_k` chunks for `query`, and whether the artifact came from
    /// the hot cache.
    fn search(&self, source: &Path, query: &[f32], top_k: usize)
        -> Result<(Vec<RetrievedChunk>, bool)>;
}

/// Loads artifacts from disk through the hot cache.
#[derive(Debug, Clone)]
pub struct ArtifactLoader {
    hot_cache: HotCache,
    bypass_cache: bool,
}

impl ArtifactLoader {
    pub fn new(hot_cache: HotCache) -> Self {
        Self {
            hot_cache,
            bypass_cache: false,
        }
    }

    /// Always read from disk and leave the hot cache untouched.
    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn load(&self, source: &Path) -> Result<(FlatIndex, bool)> {
        let dir = artifact::resolve_index_dir(source)
            .ok_or_else(|| IndexError::NotFound(format!("no artifact at {}", source.display())))?;
        if self.bypass_cache || !self.hot_cache.is_enabled() {
            return Ok((FlatIndex::load(&dir)?, false));
        }

        let key = match self.hot_cache.key_for(source) {
            Ok(key) => key,
            Err(err) => {
                tracing::debug!(source = %source.display(), error = %err, "no cache key, loading from disk");
                return Ok((FlatIndex::load(&dir)?, false));
            }
        };
        match self.hot_cache.load(&key) {
            CacheLookup::Hit(index) => Ok((index, true)),
            CacheLookup::Miss | CacheLookup::Corrupt => {
                let index = FlatIndex::load(&dir)?;
                self.hot_cache.save(&key, &index);
                Ok((index, false))
            }
        }
    }
}

impl SourceSearch for ArtifactLoader {
    fn search(
        &self,
        source: &Path,
        query: &[f32],
        top_k: usize,
    ) -> Result<(Vec<RetrievedChunk>, bool)> {
        let (index, from_cache) = self.load(source)?;
        if index.dims() != query.len() {
            return Err(IndexError::InvalidInput(format!(
                "artifact has {}-dim vectors but the query has {}",
                index.dims(),
                query.len()
            )));
        }
        Ok((index.search(query, top_k), from_cache))
    }
}

/// Display name of a source: the original filename for per-document
/// folders, otherwise the directory name.
pub fn source_display_name(source: &Path) -> String {
    if source.join(artifact::VECTOR_FILE).is_file() {
        if let Some(name) = display_name_from_manifest(source) {
            return name;
        }
    }
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.display().to_string())
}

pub struct QueryCoordinator {
    embedder: Arc<dyn Embedder>,
    searcher: Arc<dyn SourceSearch>,
    progress: Arc<dyn ProgressReporter>,
}

impl QueryCoordinator {
    pub fn new(embedder: Arc<dyn Embedder>, searcher: Arc<dyn SourceSearch>) -> Self {
        Self {
            embedder,
            searcher,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Query every source. Results come back in input order, one per source.
    pub async fn query(
        &self,
        sources: &[PathBuf],
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<SourceResult>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();

        let embedder = self.embedder.clone();
        let text = query.to_string();
        let vector = tokio::task::spawn_blocking(move || embedder.embed_query(&text))
            .await
            .map_err(|e| IndexError::Embedding(format!("query embedding task failed: {e}")))??;
        let vector = Arc::new(vector);

        let semaphore = Arc::new(Semaphore::new(options.max_workers.max(1)));
        let mut tasks: JoinSet<(usize, SourceResult)> = JoinSet::new();
        for (i, source) in sources.iter().enumerate() {
            let semaphore = semaphore.clone();
            let searcher = self.searcher.clone();
            let vector = vector.clone();
            let source = source.clone();
            let per_task = options.timeout;
            let top_k = options.top_k;
            tasks.spawn(async move {
                let name = source_display_name(&source);
                let Ok(permit) = semaphore.acquire_owned().await else {
                    return (
                        i,
                        SourceResult::failed(name, source, SourceError::Abandoned, Duration::ZERO),
                    );
                };
                let task_started = Instant::now();
                let path = source.clone();
                // The permit travels with the blocking work: a timed-out search
                // keeps its pool slot until it actually returns.
                let work = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    searcher.search(&path, &vector, top_k)
                });
                let result = match tokio::time::timeout(per_task, work).await {
                    Ok(Ok(Ok((chunks, from_cache)))) => SourceResult {
                        source_name: name,
                        source_path: source,
                        chunks,
                        time_taken_secs: task_started.elapsed().as_secs_f64(),
                        error: None,
                        from_cache,
                    },
                    Ok(Ok(Err(err))) => SourceResult::failed(
                        name,
                        source,
                        SourceError::from_index_error(&err),
                        task_started.elapsed(),
                    ),
                    Ok(Err(join_err)) => SourceResult::failed(
                        name,
                        source,
                        SourceError::Failed(join_err.to_string()),
                        task_started.elapsed(),
                    ),
                    Err(_) => SourceResult::failed(
                        name,
                        source,
                        SourceError::Timeout {
                            after_secs: per_task.as_secs_f64(),
                        },
                        task_started.elapsed(),
                    ),
                };
                (i, result)
            });
        }

        let budget = options
            .timeout
            .saturating_mul(u32::try_from(sources.len()).unwrap_or(u32::MAX));
        let deadline = tokio::time::Instant::now() + budget;
        let mut slots: Vec<Option<SourceResult>> = vec![None; sources.len()];
        let mut done: u64 = 0;
        let total = sources.len() as u64;
        let mut deadline_hit = false;

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((i, result)))) => {
                    done += 1;
                    if let Some(err) = &result.error {
                        tracing::warn!(source = %result.source_path.display(), error = %err, "source failed");
                    }
                    self.progress.report(ProgressEvent::Querying {
                        n: done,
                        total,
                        source: result.source_name.clone(),
                        ok: result.is_success(),
                    });
                    slots[i] = Some(result);
                }
                Ok(Some(Err(join_err))) => {
                    tracing::error!(error = %join_err, "query task ended unexpectedly");
                }
                Ok(None) => break,
                Err(_) => {
                    deadline_hit = true;
                    tracing::warn!(
                        pending = tasks.len(),
                        budget_secs = budget.as_secs_f64(),
                        "overall query deadline passed, abandoning pending sources"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        let results: Vec<SourceResult> = slots
            .into_iter()
            .zip(sources)
            .map(|(slot, source)| {
                slot.unwrap_or_else(|| {
                    let error = if deadline_hit {
                        SourceError::Abandoned
                    } else {
                        SourceError::Failed("query task ended unexpectedly".into())
                    };
                    SourceResult::failed(
                        source_display_name(source),
                        source.clone(),
                        error,
                        started.elapsed(),
                    )
                })
            })
            .collect();

        let failed = results.iter().filter(|r| !r.is_success()).count();
        tracing::info!(
            sources = results.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query fan-out complete"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::tests::chunks;
    use crate::embedding::HashEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(HashEmbedder::new(16))
    }

    fn make_source(root: &Path, name: &str, text: &str) -> PathBuf {
        let dir = root.join(name);
        FlatIndex::build(&chunks(&format!("{name}.txt"), &[text]), &HashEmbedder::new(16))
            .unwrap()
            .save(&dir)
            .unwrap();
        dir
    }

    fn options(workers: usize, timeout: Duration) -> QueryOptions {
        QueryOptions {
            max_workers: workers,
            timeout,
            top_k: 3,
        }
    }

    fn disk_loader() -> Arc<dyn SourceSearch> {
        Arc::new(ArtifactLoader::new(HotCache::disabled()))
    }

    #[tokio::test]
    async fn corrupt_source_is_isolated() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sources: Vec<PathBuf> = (0..5)
            .map(|i| make_source(tmp.path(), &format!("s{i}"), &format!("shared fact number {i}")))
            .collect();
        std::fs::write(sources[2].join(artifact::VECTOR_FILE), b"garbage").unwrap();

        let coordinator = QueryCoordinator::new(embedder(), disk_loader());
        let results = coordinator
            .query(&sources, "shared fact", &options(2, Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 4);
        assert!(matches!(results[2].error, Some(SourceError::Corrupt(_))));
        let order: Vec<&str> = results.iter().map(|r| r.source_name.as_str()).collect();
        assert_eq!(order, vec!["s0", "s1", "s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let coordinator = QueryCoordinator::new(embedder(), disk_loader());
        let results = coordinator
            .query(&[tmp.path().join("ghost")], "q", &options(1, Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(matches!(results[0].error, Some(SourceError::NotFound(_))));
    }

    struct SlowSearch {
        slow: Vec<PathBuf>,
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SourceSearch for SlowSearch {
        fn search(
            &self,
            source: &Path,
            _query: &[f32],
            _top_k: usize,
        ) -> Result<(Vec<RetrievedChunk>, bool)> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if self.slow.iter().any(|s| s == source) {
                std::thread::sleep(self.delay);
            } else {
                std::thread::sleep(Duration::from_millis(20));
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok((Vec::new(), false))
        }
    }

    #[tokio::test]
    async fn slow_source_times_out_without_blocking_others() {
        let sources: Vec<PathBuf> = (0..4).map(|i| PathBuf::from(format!("/src/{i}"))).collect();
        let search = Arc::new(SlowSearch {
            slow: vec![sources[1].clone()],
            delay: Duration::from_millis(1500),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let coordinator = QueryCoordinator::new(embedder(), search.clone());
        let results = coordinator
            .query(&sources, "q", &options(2, Duration::from_millis(300)))
            .await
            .unwrap();

        assert!(matches!(results[1].error, Some(SourceError::Timeout { .. })));
        for i in [0, 2, 3] {
            assert!(results[i].is_success(), "source {i}: {:?}", results[i].error);
        }
        assert!(search.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn timed_out_search_keeps_its_worker_slot() {
        let sources: Vec<PathBuf> = (0..4).map(|i| PathBuf::from(format!("/src/{i}"))).collect();
        let search = Arc::new(SlowSearch {
            slow: sources.clone(),
            delay: Duration::from_millis(300),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let coordinator = QueryCoordinator::new(embedder(), search.clone());
        let results = coordinator
            .query(&sources, "q", &options(1, Duration::from_millis(60)))
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| !r.is_success()));
        assert!(results
            .iter()
            .any(|r| matches!(r.error, Some(SourceError::Timeout { .. }))));

        // Let the abandoned blocking search run to completion before checking.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(search.running.load(Ordering::SeqCst), 0);
        assert_eq!(search.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hot_cache_serves_repeat_queries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = make_source(tmp.path(), "doc", "cached content");
        let cache = HotCache::new(
            tmp.path().join("shm"),
            "q_test",
            Duration::from_secs(600),
            crate::hot_cache::SpacePolicy {
                safe_threshold_percent: 100,
                min_free_bytes: 0,
            },
        );
        let coordinator =
            QueryCoordinator::new(embedder(), Arc::new(ArtifactLoader::new(cache)));
        let opts = options(1, Duration::from_secs(5));

        let first = coordinator.query(&[source.clone()], "cached", &opts).await.unwrap();
        let second = coordinator.query(&[source.clone()], "cached", &opts).await.unwrap();
        assert!(!first[0].from_cache);
        assert!(second[0].from_cache);
        assert_eq!(first[0].chunks, second[0].chunks);

        // Rebuilding the artifact changes the key, so the stale entry is skipped.
        make_source(tmp.path(), "doc", "rebuilt content");
        let third = coordinator.query(&[source], "rebuilt", &opts).await.unwrap();
        assert!(!third[0].from_cache);
        assert_eq!(third[0].chunks[0].text, "rebuilt content");
    }

    #[test]
    fn batch_parses_queries_and_sources() {
        let batch = QueryBatch::parse(
            r#"{"queries": ["What is SOLID?", "Clean code"], "external_sources": ["/data/books"]}"#,
        )
        .unwrap();
        assert_eq!(batch.queries, vec!["What is SOLID?", "Clean code"]);
        assert_eq!(batch.external_sources, vec![PathBuf::from("/data/books")]);

        let bare = QueryBatch::parse(r#"{"queries": ["one"]}"#).unwrap();
        assert!(bare.external_sources.is_empty());
    }

    #[test]
    fn batch_rejects_empty_and_blank_queries() {
        assert!(matches!(
            QueryBatch::parse(r#"{"queries": []}"#),
            Err(IndexError::InvalidInput(_))
        ));
        assert!(matches!(
            QueryBatch::parse(r#"{"queries": ["ok", "  "]}"#),
            Err(IndexError::InvalidInput(_))
        ));
        assert!(matches!(QueryBatch::parse("{"), Err(IndexError::Json(_))));

        let tmp = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            QueryBatch::load(&tmp.path().join("missing.json")),
            Err(IndexError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dims_mismatch_is_a_failed_source() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = make_source(tmp.path(), "doc", "text");
        let coordinator = QueryCoordinator::new(Arc::new(HashEmbedder::new(8)), disk_loader());
        let results = coordinator
            .query(&[source], "text", &options(1, Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(matches!(results[0].error, Some(SourceError::Failed(_))));
    }
}
