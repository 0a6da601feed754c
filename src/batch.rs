//! Merging many source artifacts with bounded memory.
//!
//! [`merge_sources`] folds sources into one artifact sequentially, one
//! source deserialized at a time. [`BatchMerger`] splits a large source list
//! into fixed-size batches, merges each into an intermediate artifact under
//! `<output>.batches/`, then merges the intermediates, repeating per level
//! until one artifact remains.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifact::FlatIndex;
use crate::error::{IndexError, Result};
use crate::fsutil::remove_dir_best_effort;
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Outcome of one sequential merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeTally {
    pub merged: usize,
    pub failed: Vec<(PathBuf, String)>,
    pub chunks: usize,
}

/// Load `sources` one at a time and fold them into a single artifact at
/// `output`. Sources that fail to load are skipped and reported. Nothing is
/// written when no source could be merged.
fn merge_into(sources: &[PathBuf], output: &Path) -> Result<MergeTally> {
    let mut tally = MergeTally::default();
    let mut merged: Option<FlatIndex> = None;

    for source in sources {
        let loaded = match FlatIndex::load(source) {
            Ok(index) => index,
            Err(err) => {
                tracing::warn!(source = %source.display(), error = %err, "skipping unreadable source");
                tally.failed.push((source.clone(), err.to_string()));
                continue;
            }
        };
        match merged.as_mut() {
            None => merged = Some(loaded),
            Some(acc) => {
                if let Err(err) = acc.merge_from(loaded) {
                    tracing::warn!(source = %source.display(), error = %err, "skipping incompatible source");
                    tally.failed.push((source.clone(), err.to_string()));
                    continue;
                }
            }
        }
        tally.merged += 1;
    }

    if let Some(index) = merged {
        tally.chunks = index.len();
        index.save(output)?;
    }
    Ok(tally)
}

/// Merge `sources` directly into `output`. Fails if none could be merged.
pub fn merge_sources(sources: &[PathBuf], output: &Path) -> Result<MergeTally> {
    let tally = merge_into(sources, output)?;
    if tally.merged == 0 {
        return Err(IndexError::Merge(format!(
            "none of {} sources could be merged",
            sources.len()
        )));
    }
    Ok(tally)
}

/// Consecutive groups of `batch_size`, in input order.
pub fn split_into_batches<T: Clone>(items: &[T], batch_size: usize) -> Vec<Vec<T>> {
    items
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchMergeReport {
    /// Intermediate levels written (0 for a direct merge).
    pub levels: u32,
    pub batches: usize,
    pub batches_dropped: usize,
    /// Original sources that made it into the output.
    pub merged: usize,
    /// Original sources that could not be loaded.
    pub failed: Vec<(PathBuf, String)>,
    pub chunks: usize,
    /// Set when intermediates were kept on request.
    pub work_dir: Option<PathBuf>,
}

pub struct BatchMerger {
    batch_size: usize,
    keep_batches: bool,
    progress: Arc<dyn ProgressReporter>,
}

impl BatchMerger {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            keep_batches: false,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn keep_batches(mut self, keep: bool) -> Self {
        self.keep_batches = keep;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn work_dir_for(output: &Path) -> PathBuf {
        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        output.with_file_name(format!("{name}.batches"))
    }

    pub fn merge_all(&self, sources: &[PathBuf], output: &Path) -> Result<BatchMergeReport> {
        if self.batch_size == 0 {
            return Err(IndexError::InvalidInput("batch size must be at least 1".into()));
        }
        if sources.is_empty() {
            return Err(IndexError::Merge("no sources to merge".into()));
        }

        let work_dir = Self::work_dir_for(output);
        if work_dir.exists() {
            remove_dir_best_effort(&work_dir);
        }

        let result = self.run_levels(sources, output, &work_dir);
        let keep = self.keep_batches && result.is_ok();
        if !keep && work_dir.exists() {
            remove_dir_best_effort(&work_dir);
        }
        result.map(|mut report| {
            if keep && work_dir.exists() {
                report.work_dir = Some(work_dir);
            }
            report
        })
    }

    fn run_levels(
        &self,
        sources: &[PathBuf],
        output: &Path,
        work_dir: &Path,
    ) -> Result<BatchMergeReport> {
        let mut report = BatchMergeReport::default();
        let mut current: Vec<PathBuf> = sources.to_vec();
        let mut level: u32 = 0;

        loop {
            // A group of one would never shrink the list past level 0.
            let group = if level == 0 {
                self.batch_size
            } else {
                self.batch_size.max(2)
            };

            if current.len() <= group {
                let tally = merge_sources(&current, output)?;
                if level == 0 {
                    report.merged = tally.merged;
                    report.failed = tally.failed;
                } else if !tally.failed.is_empty() {
                    return Err(IndexError::Merge(format!(
                        "{} intermediate batch artifacts could not be read back",
                        tally.failed.len()
                    )));
                }
                report.chunks = tally.chunks;
                report.levels = level;
                return Ok(report);
            }

            let batches = split_into_batches(&current, group);
            let total = batches.len() as u64;
            let mut next = Vec::with_capacity(batches.len());
            for (i, batch) in batches.iter().enumerate() {
                let dir = work_dir.join(format!("level{level}_batch_{i:03}"));
                let tally = merge_into(batch, &dir)?;
                self.progress.report(ProgressEvent::Merging {
                    level,
                    n: i as u64 + 1,
                    total,
                });
                report.batches += 1;

                if tally.merged == 0 {
                    tracing::warn!(level, batch = i, sources = batch.len(), "dropping batch with no readable sources");
                    report.batches_dropped += 1;
                } else {
                    if !tally.failed.is_empty() {
                        tracing::warn!(
                            level,
                            batch = i,
                            merged = tally.merged,
                            failed = tally.failed.len(),
                            "batch partially merged"
                        );
                    }
                    next.push(dir);
                }

                if level == 0 {
                    report.merged += tally.merged;
                    report.failed.extend(tally.failed);
                } else if !tally.failed.is_empty() {
                    return Err(IndexError::Merge(format!(
                        "intermediate batch artifacts at level {level} could not be read back"
                    )));
                }
            }

            tracing::info!(
                level,
                batches = total,
                kept = next.len(),
                "merge level complete"
            );
            if next.is_empty() {
                return Err(IndexError::Merge(format!(
                    "every batch at level {level} failed"
                )));
            }
            current = next;
            level += 1;
        }
    }
}
