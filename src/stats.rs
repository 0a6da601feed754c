//! Corpus status overview.
//!
//! Summarizes what is on disk for one corpus: tracked documents, per-document
//! artifacts, the aggregate, backups, and the hot cache. Used by `cidx status`
//! to confirm that syncs are landing where they should.

use anyhow::{Context, Result};
use std::path::Path;

use crate::artifact;
use crate::atomic;
use crate::config::Config;
use crate::fsutil::dir_size;
use crate::hot_cache::HotCache;
use crate::manifest::Manifest;
use crate::per_doc;

/// Run the status command: inspect the corpus and print a summary.
pub fn run_status(config: &Config, corpus_dir: &Path, hot_cache: &HotCache) -> Result<()> {
    let manifest = Manifest::load(&Manifest::path_in(corpus_dir))
        .with_context(|| format!("Failed to read manifest in {}", corpus_dir.display()))?;

    let cache_root = config.corpus.cache_root(corpus_dir);
    let cached = per_doc::list_cached(&cache_root)
        .with_context(|| format!("Failed to list {}", cache_root.display()))?;
    let valid = cached.iter().filter(|doc| doc.valid).count();
    let cached_bytes: u64 = cached.iter().map(|doc| doc.bytes).sum();

    let aggregate_dir = config.corpus.aggregate_dir(corpus_dir);
    let aggregate_valid = artifact::is_valid_dir(&aggregate_dir);
    let backups = atomic::list_backups(&aggregate_dir);

    println!("Corpus Index Status");
    println!("===================");
    println!();
    println!("  Corpus:      {}", corpus_dir.display());
    println!("  Tracked:     {} documents", manifest.files.len());
    println!(
        "  Artifacts:   {} / {} valid ({})",
        valid,
        cached.len(),
        format_bytes(cached_bytes)
    );
    println!();

    if aggregate_valid {
        println!(
            "  Aggregate:   {} ({})",
            aggregate_dir.display(),
            format_bytes(dir_size(&aggregate_dir))
        );
    } else if aggregate_dir.exists() {
        println!("  Aggregate:   {} (invalid)", aggregate_dir.display());
    } else {
        println!("  Aggregate:   none");
    }
    let last_merged = manifest
        .merge_tracking
        .last_merged_at
        .as_deref()
        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| format_ts_relative(dt.timestamp()))
        .unwrap_or_else(|| "never".to_string());
    println!("  Last merge:  {}", last_merged);
    let concat = &manifest.merge_tracking.concat_hash;
    println!(
        "  Concat hash: {}",
        if concat.is_empty() { "-" } else { concat.as_str() }
    );
    println!("  Backups:     {}", backups.len());
    println!();

    if !hot_cache.is_enabled() {
        println!("  Hot cache:   disabled");
    } else {
        let stats = hot_cache
            .stats()
            .with_context(|| format!("Failed to read hot cache at {}", hot_cache.dir().display()))?;
        println!("  Hot cache:   {}", hot_cache.dir().display());
        println!(
            "  Entries:     {} ({})",
            stats.entries,
            format_bytes(stats.blob_bytes)
        );
        if let Some(usage) = stats.usage {
            println!(
                "  Store:       {} free of {} ({:.0}% used)",
                format_bytes(usage.free),
                format_bytes(usage.total),
                usage.usage_percent()
            );
        }
    }
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert_eq!(format_ts_relative(now - 3 * 86400), "3 days ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }

    #[test]
    fn test_status_on_fresh_corpus() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::for_corpus(tmp.path());
        run_status(&config, tmp.path(), &HotCache::disabled()).unwrap();
    }
}
