//! Command handlers behind the `cidx` binary.
//!
//! Each `run_*` function drives one subcommand through the library API and
//! prints a human summary to stdout. Errors are `anyhow` with context so the
//! binary can report them as-is.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::AggregatedResult;
use crate::config::Config;
use crate::corpus::{CorpusIndex, SearchScope};
use crate::hot_cache::HotCache;
use crate::merge::{MergeMode, MergeOptions};
use crate::per_doc;
use crate::query::QueryOptions;
use crate::stats::format_bytes;

/// Print an aggregated result in the requested format.
pub fn print_result(result: &AggregatedResult, format: &str) -> Result<()> {
    match format {
        "markdown" | "md" => print!("{}", result.to_markdown()),
        "json" => println!(
            "{}",
            serde_json::to_string_pretty(&result.to_json()).context("Failed to render JSON")?
        ),
        _ => bail!("Unknown output format: {}. Use 'json' or 'markdown'.", format),
    }
    Ok(())
}

pub async fn run_sync(index: &CorpusIndex, corpus_dir: &Path, options: MergeOptions) -> Result<()> {
    let dry_run = options.dry_run;
    let report = index
        .sync_corpus_async(corpus_dir, options)
        .await
        .with_context(|| format!("Failed to sync {}", corpus_dir.display()))?;

    if dry_run || report.read_only {
        println!(
            "sync {} ({})",
            corpus_dir.display(),
            if report.read_only { "read-only" } else { "dry-run" }
        );
        println!("  state: {:?}", report.state);
        println!("  documents: {}", report.documents);
        println!("  changes: {}", report.delta.summary());
        for name in &report.delta.added {
            println!("    + {}", name);
        }
        for name in &report.delta.modified {
            println!("    ~ {}", name);
        }
        for name in &report.delta.removed {
            println!("    - {}", name);
        }
        return Ok(());
    }

    println!("sync {}", corpus_dir.display());
    println!("  state: {:?}", report.state);
    println!("  documents: {}", report.documents);
    println!("  built: {}", report.built);
    println!("  cached: {}", report.cached);
    if !report.failed.is_empty() {
        println!("  failed: {}", report.failed.len());
        for (name, reason) in &report.failed {
            println!("    {}: {}", name, reason);
        }
    }
    if report.merged {
        let mode = match report.mode {
            Some(MergeMode::Batch { batch_size }) => format!("batch (size {})", batch_size),
            _ => "direct".to_string(),
        };
        println!("  merged: {} sources, {} chunks, {}", report.sources_merged, report.chunks, mode);
        if report.sources_failed > 0 {
            println!("  merge skipped: {} sources", report.sources_failed);
        }
        if let Some(backup) = &report.backup_dir {
            println!("  backup: {}", backup.display());
        }
    } else {
        println!("  aggregate up to date");
    }
    println!("  concat hash: {}", report.concatenated_hash);
    println!("  elapsed: {:.2}s", report.elapsed_secs);
    println!("ok");
    Ok(())
}

pub async fn run_search(
    index: &CorpusIndex,
    corpus_dir: &Path,
    query: &str,
    top_k: Option<usize>,
    per_document: bool,
    force_rebuild: bool,
    format: &str,
) -> Result<()> {
    let scope = if per_document {
        SearchScope::PerDocument
    } else {
        SearchScope::Aggregate
    };
    let result = index
        .search_corpus(corpus_dir, query, top_k, force_rebuild, scope)
        .await
        .with_context(|| format!("Search failed in {}", corpus_dir.display()))?;
    print_result(&result, format)
}

/// Everything `cidx query` needs besides the index itself.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub queries: Vec<String>,
    /// Artifact directories given directly.
    pub sources: Vec<PathBuf>,
    /// Per-document artifacts of the corpus, selected by content hash.
    pub source_hashes: Vec<String>,
    pub workers: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub top_k: Option<usize>,
    pub no_cache: bool,
    /// Save each result as JSON here.
    pub output_dir: Option<PathBuf>,
}

pub async fn run_query(
    index: &CorpusIndex,
    corpus_dir: &Path,
    request: &QueryRequest,
    format: &str,
) -> Result<()> {
    if request.queries.is_empty() {
        bail!("No query given. Pass a query or --batch-file <json>.");
    }
    let mut sources = request.sources.clone();
    if !request.source_hashes.is_empty() {
        let selected = index
            .sources_by_hash(corpus_dir, &request.source_hashes)
            .with_context(|| format!("Failed to select sources in {}", corpus_dir.display()))?;
        for dir in selected {
            if !sources.contains(&dir) {
                sources.push(dir);
            }
        }
    }
    if sources.is_empty() {
        bail!("No sources given. Pass --source <dir> or --source-hashes <hash,...>.");
    }

    let mut options = QueryOptions::from_config(&index.config().query);
    if let Some(n) = request.workers {
        options.max_workers = n;
    }
    if let Some(secs) = request.timeout_secs {
        options.timeout = Duration::from_secs(secs);
    }
    if let Some(k) = request.top_k {
        options.top_k = k;
    }
    if options.max_workers == 0 || options.top_k == 0 || options.timeout.is_zero() {
        bail!("--workers, --timeout and --top-k must be at least 1");
    }

    let results = index
        .query_batch(&sources, &request.queries, &options, request.no_cache)
        .await?;

    if let Some(dir) = &request.output_dir {
        let batched = results.len() > 1;
        for (n, result) in results.iter().enumerate() {
            let path = result
                .save_json(dir, batched.then_some(n + 1))
                .with_context(|| format!("Failed to save result in {}", dir.display()))?;
            tracing::info!(path = %path.display(), query = %result.query, "saved result");
        }
    }

    print_results(&results, format)?;
    if results.iter().all(|r| r.successful == 0) {
        bail!("All {} sources failed", sources.len());
    }
    Ok(())
}

/// Print several results: a JSON array, or markdown sections separated by rules.
pub fn print_results(results: &[AggregatedResult], format: &str) -> Result<()> {
    if let [single] = results {
        return print_result(single, format);
    }
    match format {
        "markdown" | "md" => {
            let rendered: Vec<String> = results.iter().map(|r| r.to_markdown()).collect();
            print!("{}", rendered.join("\n---\n\n"));
        }
        "json" => {
            let all: Vec<serde_json::Value> = results.iter().map(|r| r.to_json()).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&all).context("Failed to render JSON")?
            );
        }
        _ => bail!("Unknown output format: {}. Use 'json' or 'markdown'.", format),
    }
    Ok(())
}

/// List the per-document artifacts a query can select with `--source-hashes`.
pub fn run_list_sources(index: &CorpusIndex, corpus_dir: &Path, format: &str) -> Result<()> {
    let docs = index
        .list_sources(corpus_dir)
        .with_context(|| format!("Failed to list sources in {}", corpus_dir.display()))?;
    match format {
        "json" => {
            let listed: Vec<serde_json::Value> = docs
                .iter()
                .map(|doc| {
                    serde_json::json!({
                        "filename": doc.display_name(),
                        "file_hash": doc.content_hash,
                        "chunks": doc.metadata.as_ref().map(|m| m.chunks),
                        "trained_at": doc.metadata.as_ref().map(|m| m.trained_at.clone()),
                        "path": doc.dir.display().to_string(),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&listed).context("Failed to render JSON")?
            );
        }
        "markdown" | "md" => {
            if docs.is_empty() {
                println!("No per-document artifacts in {}.", corpus_dir.display());
            }
            for doc in &docs {
                println!("  {}  {}", doc.content_hash, doc.display_name());
            }
        }
        _ => bail!("Unknown output format: {}. Use 'json' or 'markdown'.", format),
    }
    Ok(())
}

pub fn run_orphans(index: &CorpusIndex, corpus_dir: &Path, dry_run: bool, yes: bool) -> Result<()> {
    let orphans = index
        .find_orphans(corpus_dir)
        .with_context(|| format!("Failed to scan {}", corpus_dir.display()))?;

    println!("orphans {}{}", corpus_dir.display(), if dry_run { " (dry-run)" } else { "" });
    println!("  live folders: {}", orphans.kept);
    println!(
        "  orphaned: {} ({})",
        orphans.len(),
        format_bytes(orphans.total_bytes())
    );
    for entry in &orphans.entries {
        println!("    {}  {}", entry.content_hash, format_bytes(entry.bytes));
    }
    if dry_run || orphans.is_empty() {
        return Ok(());
    }

    let threshold = index.config().merge.orphan_confirm_threshold;
    if orphans.requires_confirmation(threshold) && !yes {
        bail!(
            "Refusing to delete {} folders (more than {}). Re-run with --yes.",
            orphans.len(),
            threshold
        );
    }
    let (_, cleanup) = index.remove_orphans(corpus_dir, yes)?;
    println!("  removed: {}", cleanup.removed);
    if cleanup.failed > 0 {
        println!("  failed: {}", cleanup.failed);
    }
    println!("  reclaimed: {}", format_bytes(cleanup.reclaimed_bytes));
    Ok(())
}

pub fn run_cache_list(config: &Config, corpus_dir: &Path) -> Result<()> {
    let cache_root = config.corpus.cache_root(corpus_dir);
    let cached = per_doc::list_cached(&cache_root)
        .with_context(|| format!("Failed to list {}", cache_root.display()))?;
    if cached.is_empty() {
        println!("No per-document artifacts.");
        return Ok(());
    }

    println!(
        "  {:<32} {:<28} {:>7} {:>10}   {}",
        "HASH", "DOCUMENT", "CHUNKS", "SIZE", "TRAINED"
    );
    println!("  {}", "-".repeat(100));
    for doc in &cached {
        let (chunks, trained) = match &doc.metadata {
            Some(m) => (m.chunks.to_string(), m.trained_at.clone()),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "  {:<32} {:<28} {:>7} {:>10}   {}{}",
            doc.content_hash,
            doc.display_name(),
            chunks,
            format_bytes(doc.bytes),
            trained,
            if doc.valid { "" } else { "  (invalid)" }
        );
    }
    Ok(())
}

pub fn run_cache_stats(hot_cache: &HotCache) -> Result<()> {
    if !hot_cache.is_enabled() {
        println!("hot cache disabled");
        return Ok(());
    }
    let stats = hot_cache.stats()?;
    println!("hot cache {}", hot_cache.dir().display());
    println!("  entries: {}", stats.entries);
    println!("  blob bytes: {}", format_bytes(stats.blob_bytes));
    println!("  ttl: {}h", hot_cache.ttl().as_secs() / 3600);
    if let Some(usage) = stats.usage {
        println!("  store total: {}", format_bytes(usage.total));
        println!("  store used: {}", format_bytes(usage.used()));
        println!("  store free: {}", format_bytes(usage.free));
        println!("  store usage: {:.1}%", usage.usage_percent());
    }
    Ok(())
}

pub fn run_cache_sweep(hot_cache: &HotCache) -> Result<()> {
    let removed = hot_cache.sweep_expired()?;
    println!("cache sweep");
    println!("  expired entries removed: {}", removed);
    Ok(())
}

pub fn run_cache_clear(hot_cache: &HotCache, yes: bool) -> Result<()> {
    if !yes {
        bail!(
            "This deletes every cached blob in {}. Re-run with --yes.",
            hot_cache.dir().display()
        );
    }
    let removed = hot_cache.clear_all()?;
    println!("cache clear");
    println!("  files removed: {}", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::loader::FileLoader;
    use std::sync::Arc;

    fn index_for(dir: &Path) -> CorpusIndex {
        let config = Config::for_corpus(dir);
        CorpusIndex::with_services(
            config.clone(),
            Arc::new(FileLoader::new(&config.chunking)),
            Arc::new(HashEmbedder::new(32)),
        )
        .with_hot_cache(HotCache::disabled())
    }

    #[test]
    fn unknown_format_is_rejected() {
        let agg = crate::aggregate::aggregate("q", &[], Duration::ZERO);
        assert!(print_result(&agg, "yaml").is_err());
        assert!(print_result(&agg, "json").is_ok());
    }

    #[test]
    fn cache_clear_needs_yes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let policy = crate::hot_cache::SpacePolicy {
            safe_threshold_percent: 100,
            min_free_bytes: 0,
        };
        let cache = HotCache::new(tmp.path(), "cidx", Duration::from_secs(3600), policy);
        assert!(run_cache_clear(&cache, false).is_err());
        assert!(run_cache_clear(&cache, true).is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_with_only_missing_sources_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index = index_for(tmp.path());
        let request = QueryRequest {
            queries: vec!["anything".into()],
            sources: vec![tmp.path().join("nope")],
            no_cache: true,
            ..Default::default()
        };
        let err = run_query(&index, tmp.path(), &request, "json").await.unwrap_err();
        assert!(err.to_string().contains("All 1 sources failed"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_without_sources_or_queries_is_refused() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index = index_for(tmp.path());
        let no_sources = QueryRequest {
            queries: vec!["q".into()],
            ..Default::default()
        };
        let err = run_query(&index, tmp.path(), &no_sources, "json").await.unwrap_err();
        assert!(err.to_string().contains("No sources given"));

        let no_queries = QueryRequest {
            sources: vec![tmp.path().to_path_buf()],
            ..Default::default()
        };
        let err = run_query(&index, tmp.path(), &no_queries, "json").await.unwrap_err();
        assert!(err.to_string().contains("No query given"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_by_hash_saves_one_file_per_query() {
        let tmp = tempfile::TempDir::new().unwrap();
        let corpus = tmp.path().join("corpus");
        std::fs::create_dir_all(&corpus).unwrap();
        std::fs::write(corpus.join("a.txt"), "alpha text about borrowing").unwrap();
        std::fs::write(corpus.join("b.txt"), "beta text about packaging").unwrap();
        let index = index_for(&corpus);
        run_sync(&index, &corpus, MergeOptions::default()).await.unwrap();
        run_list_sources(&index, &corpus, "json").unwrap();
        run_list_sources(&index, &corpus, "markdown").unwrap();

        let hashes: Vec<String> = index
            .list_sources(&corpus)
            .unwrap()
            .into_iter()
            .map(|doc| doc.content_hash)
            .collect();
        let out = tmp.path().join("results");
        let request = QueryRequest {
            queries: vec!["borrowing".into(), "packaging".into()],
            source_hashes: hashes,
            no_cache: true,
            output_dir: Some(out.clone()),
            ..Default::default()
        };
        run_query(&index, &corpus, &request, "json").await.unwrap();

        let mut saved: Vec<String> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        saved.sort();
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().any(|n| n.contains("_q1_")));
        assert!(saved.iter().any(|n| n.contains("_q2_")));
        for name in &saved {
            let json: serde_json::Value =
                serde_json::from_slice(&std::fs::read(out.join(name)).unwrap()).unwrap();
            assert_eq!(json["sources"]["successful"], 2);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_then_orphans_dry_run() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "alpha text").unwrap();
        let index = index_for(tmp.path());
        run_sync(&index, tmp.path(), MergeOptions::default()).await.unwrap();
        run_cache_list(index.config(), tmp.path()).unwrap();
        run_orphans(&index, tmp.path(), true, false).unwrap();
    }
}
