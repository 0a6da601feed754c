//! Deduplication and rendering of fan-out query results.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::fsutil::atomic_write;
use crate::hashing::hash_bytes;
use crate::query::SourceResult;

/// A unique chunk and every source that returned it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedChunk {
    pub content: String,
    pub content_hash: String,
    /// Display names of the contributing sources in first-seen order, one
    /// per distinct source path.
    pub sources: Vec<String>,
    /// Original files the chunk was cut from, across all sources.
    pub files: Vec<String>,
    pub best_score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    pub query: String,
    pub timestamp: String,
    pub chunks: Vec<AggregatedChunk>,
    /// Chunks returned before deduplication.
    pub total_found: usize,
    pub duplicates_removed: usize,
    pub successful: usize,
    pub failed: usize,
    /// Failed sources with the reason.
    pub failures: Vec<(String, String)>,
    pub total_time_secs: f64,
}

/// Collapse chunks with identical (trimmed) text, keeping first-seen order.
pub fn aggregate(query: &str, results: &[SourceResult], elapsed: Duration) -> AggregatedResult {
    let mut chunks: Vec<AggregatedChunk> = Vec::new();
    let mut by_hash: HashMap<String, usize> = HashMap::new();
    let mut seen_paths: Vec<Vec<&PathBuf>> = Vec::new();
    let mut total_found = 0;
    let mut failures = Vec::new();

    for result in results {
        if let Some(err) = &result.error {
            failures.push((result.source_name.clone(), err.to_string()));
            continue;
        }
        for chunk in &result.chunks {
            total_found += 1;
            let content = chunk.text.trim();
            let content_hash = hash_bytes(content.as_bytes());
            match by_hash.get(&content_hash) {
                Some(&i) => {
                    let existing = &mut chunks[i];
                    if !seen_paths[i].contains(&&result.source_path) {
                        seen_paths[i].push(&result.source_path);
                        existing.sources.push(result.source_name.clone());
                    }
                    if !chunk.source_file.is_empty() && !existing.files.contains(&chunk.source_file) {
                        existing.files.push(chunk.source_file.clone());
                    }
                    existing.best_score = existing.best_score.max(chunk.score);
                }
                None => {
                    by_hash.insert(content_hash.clone(), chunks.len());
                    seen_paths.push(vec![&result.source_path]);
                    let files = if chunk.source_file.is_empty() {
                        Vec::new()
                    } else {
                        vec![chunk.source_file.clone()]
                    };
                    chunks.push(AggregatedChunk {
                        content: content.to_string(),
                        content_hash,
                        sources: vec![result.source_name.clone()],
                        files,
                        best_score: chunk.score,
                    });
                }
            }
        }
    }

    let successful = results.len() - failures.len();
    AggregatedResult {
        query: query.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        duplicates_removed: total_found - chunks.len(),
        total_found,
        chunks,
        successful,
        failed: failures.len(),
        failures,
        total_time_secs: elapsed.as_secs_f64(),
    }
}

impl AggregatedResult {
    pub fn to_json(&self) -> serde_json::Value {
        let data: Vec<serde_json::Value> = self
            .chunks
            .iter()
            .map(|c| {
                serde_json::json!({
                    "source": c.sources.join(", "),
                    "sources": c.sources,
                    "files": c.files,
                    "content": c.content,
                })
            })
            .collect();
        serde_json::json!({
            "query": self.query,
            "timestamp": self.timestamp,
            "sources": {
                "total": self.successful + self.failed,
                "successful": self.successful,
                "failed": self.failed,
            },
            "results": {
                "total_found": self.total_found,
                "duplicates_removed": self.duplicates_removed,
                "data": data,
            },
            "execution": {
                "total_time_seconds": self.total_time_secs,
            },
        })
    }

    /// Write the JSON rendering into `dir` and return the file written.
    ///
    /// Files are named `<query hash>_<timestamp>.json`; `position` (1-based,
    /// for batches) adds a `_q<n>` so repeated queries in one batch do not
    /// collide.
    pub fn save_json(&self, dir: &Path, position: Option<usize>) -> Result<PathBuf> {
        let query_hash = hash_bytes(self.query.as_bytes());
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let name = match position {
            Some(n) => format!("{}_q{}_{}.json", &query_hash[..12], n, stamp),
            None => format!("{}_{}.json", &query_hash[..12], stamp),
        };
        let path = dir.join(name);
        atomic_write(&path, &serde_json::to_vec_pretty(&self.to_json())?)?;
        Ok(path)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Results for \"{}\"\n\n", self.query));
        out.push_str(&format!(
            "_{} of {} sources answered, {} unique chunks ({} duplicates removed), {:.2}s_\n",
            self.successful,
            self.successful + self.failed,
            self.chunks.len(),
            self.duplicates_removed,
            self.total_time_secs
        ));
        for (i, chunk) in self.chunks.iter().enumerate() {
            out.push_str(&format!("\n## {}. {}\n\n", i + 1, chunk.sources.join(", ")));
            out.push_str(&chunk.content);
            out.push('\n');
        }
        if !self.failures.is_empty() {
            out.push_str("\n## Failed sources\n\n");
            for (source, reason) in &self.failures {
                out.push_str(&format!("- {source}: {reason}\n"));
            }
        }
        out
    }
}
