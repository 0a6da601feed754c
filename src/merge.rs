//! Sync pipeline: scan, build per-document artifacts, merge, record.
//!
//! ```text
//! scan corpus ──► ensure per-document artifacts ──► refresh merge tracking
//!                                                          │
//!                        concat hash unchanged and aggregate valid?
//!                           │ yes                        │ no
//!                    save manifest              merge into temp dir
//!                                               (direct or batched)
//!                                                        │
//!                                               atomic replace target
//!                                                        │
//!                                           mark merged, save manifest
//! ```
//!
//! The manifest is written only after the new aggregate is in place. A
//! failed merge leaves the previous manifest on disk, so the next run sees
//! the same change and retries.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::artifact;
use crate::atomic::AtomicMergeWriter;
use crate::batch::{merge_sources, BatchMerger};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{IndexError, Result};
use crate::loader::DocumentLoader;
use crate::lock::CorpusLock;
use crate::manifest::{CorpusScanner, Manifest, ManifestDelta, ScanOptions};
use crate::models::ArtifactRef;
use crate::per_doc::{EnsureStatus, PerDocumentCache};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusState {
    Unchanged,
    Changed,
    /// No usable aggregate exists yet.
    Initial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum MergeMode {
    Direct,
    Batch { batch_size: usize },
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Detect and report only. Nothing is written.
    pub dry_run: bool,
    /// Force batch mode with this batch size.
    pub batch_size: Option<usize>,
    /// Only consider the first N documents.
    pub limit: Option<usize>,
    /// Merge even if nothing changed.
    pub force: bool,
    /// Rebuild every per-document artifact.
    pub rebuild_documents: bool,
    /// `Some(false)` writes the aggregate in place. Defaults to the config.
    pub atomic: Option<bool>,
    pub keep_batches: bool,
    pub force_rehash: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub corpus_dir: PathBuf,
    pub state: CorpusState,
    pub delta: ManifestDelta,
    pub dry_run: bool,
    pub read_only: bool,
    pub documents: usize,
    pub built: usize,
    pub cached: usize,
    /// Documents that could not be scanned or built, with the reason.
    pub failed: Vec<(String, String)>,
    pub merged: bool,
    pub mode: Option<MergeMode>,
    pub sources_merged: usize,
    pub sources_failed: usize,
    pub chunks: usize,
    pub backup_dir: Option<PathBuf>,
    pub concatenated_hash: String,
    pub elapsed_secs: f64,
}

impl MergeReport {
    fn new(corpus_dir: &Path, state: CorpusState, delta: ManifestDelta) -> Self {
        Self {
            corpus_dir: corpus_dir.to_path_buf(),
            state,
            delta,
            dry_run: false,
            read_only: false,
            documents: 0,
            built: 0,
            cached: 0,
            failed: Vec::new(),
            merged: false,
            mode: None,
            sources_merged: 0,
            sources_failed: 0,
            chunks: 0,
            backup_dir: None,
            concatenated_hash: String::new(),
            elapsed_secs: 0.0,
        }
    }
}

struct MergeOutcome {
    merged: Vec<ArtifactRef>,
    failed: usize,
    chunks: usize,
    backup_dir: Option<PathBuf>,
}

pub struct MergeOrchestrator {
    config: Config,
    loader: Arc<dyn DocumentLoader>,
    embedder: Arc<dyn Embedder>,
    progress: Arc<dyn ProgressReporter>,
}

impl MergeOrchestrator {
    pub fn new(
        config: Config,
        loader: Arc<dyn DocumentLoader>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            config,
            loader,
            embedder,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    fn lock(corpus_dir: &Path) -> Result<CorpusLock> {
        match CorpusLock::try_acquire(corpus_dir) {
            Err(IndexError::Busy(_)) => {
                tracing::warn!(corpus = %corpus_dir.display(), "another sync is running, waiting");
                CorpusLock::acquire(corpus_dir)
            }
            other => other,
        }
    }

    pub fn sync(&self, corpus_dir: &Path, options: &MergeOptions) -> Result<MergeReport> {
        let started = Instant::now();
        if !corpus_dir.is_dir() {
            return Err(IndexError::NotFound(format!(
                "corpus directory {}",
                corpus_dir.display()
            )));
        }
        let read_only = self.config.corpus.is_read_only(corpus_dir);
        let report_only = options.dry_run || read_only;
        let _lock = if report_only {
            None
        } else {
            Some(Self::lock(corpus_dir)?)
        };

        self.progress.report(ProgressEvent::Scanning {
            corpus: corpus_dir.display().to_string(),
        });
        let manifest_path = Manifest::path_in(corpus_dir);
        let mut manifest = Manifest::load(&manifest_path)?;
        let scanner = CorpusScanner::from_config(&self.config)?;
        let scan = scanner.scan(
            corpus_dir,
            &manifest,
            &ScanOptions {
                force_rehash: options.force_rehash,
                limit: options.limit,
            },
        )?;

        let aggregate_dir = self.config.corpus.aggregate_dir(corpus_dir);
        let aggregate_valid = artifact::is_valid_dir(&aggregate_dir);
        let state = if !aggregate_valid {
            CorpusState::Initial
        } else if scan.delta.concatenated_hash_changed || !scan.delta.is_empty() {
            CorpusState::Changed
        } else {
            CorpusState::Unchanged
        };

        let mut report = MergeReport::new(corpus_dir, state, scan.delta.clone());
        report.dry_run = options.dry_run;
        report.read_only = read_only;
        report.documents = scan.documents.len();
        report.failed = scan.failures.clone();
        report.concatenated_hash = scan.concatenated_hash.clone();

        tracing::info!(
            corpus = %corpus_dir.display(),
            documents = scan.documents.len(),
            state = ?state,
            changes = %scan.delta.summary(),
            "corpus scanned"
        );

        if report_only {
            if read_only && !options.dry_run {
                tracing::warn!(corpus = %corpus_dir.display(), "read-only corpus, not rebuilding");
            }
            report.elapsed_secs = started.elapsed().as_secs_f64();
            return Ok(report);
        }

        let cache = PerDocumentCache::new(
            self.config.corpus.cache_root(corpus_dir),
            self.loader.clone(),
            self.embedder.clone(),
        );
        let mut artifacts: BTreeMap<String, ArtifactRef> = BTreeMap::new();
        let total = scan.documents.len() as u64;
        for (i, doc) in scan.documents.iter().enumerate() {
            let outcome = if options.rebuild_documents {
                cache.rebuild(doc)
            } else {
                cache.ensure(doc)
            };
            match outcome {
                Ok(outcome) => {
                    match outcome.status {
                        EnsureStatus::Built => report.built += 1,
                        EnsureStatus::Cached => report.cached += 1,
                    }
                    artifacts.insert(outcome.artifact.content_hash.clone(), outcome.artifact);
                }
                Err(err) => {
                    tracing::warn!(document = %doc.name, error = %err, "document skipped");
                    report.failed.push((doc.name.clone(), err.to_string()));
                }
            }
            self.progress.report(ProgressEvent::Training {
                n: i as u64 + 1,
                total,
                document: doc.name.clone(),
            });
        }

        let sources: Vec<ArtifactRef> = artifacts.into_values().collect();
        manifest.files = scan.files;
        let tracking = manifest.apply_tracking(&sources, scanner.hasher())?;
        report.concatenated_hash = tracking.concat_hash.clone();

        let needed = options.force
            || tracking.concat_changed
            || tracking.indexes_changed
            || !aggregate_valid;
        if !needed {
            manifest.save(&manifest_path)?;
            tracing::info!(corpus = %corpus_dir.display(), "aggregate up to date");
            report.elapsed_secs = started.elapsed().as_secs_f64();
            return Ok(report);
        }
        if sources.is_empty() {
            return Err(IndexError::NotFound(format!(
                "no document artifacts to merge in {}",
                corpus_dir.display()
            )));
        }

        let mode = match options.batch_size {
            Some(batch_size) => MergeMode::Batch { batch_size },
            None if sources.len() > self.config.merge.batch_threshold => MergeMode::Batch {
                batch_size: self.config.merge.batch_size,
            },
            None => MergeMode::Direct,
        };
        report.mode = Some(mode);
        let atomic = options.atomic.unwrap_or(self.config.merge.atomic);
        let keep_batches = options.keep_batches || self.config.merge.keep_batches;

        let outcome = if atomic {
            self.merge_atomic(&sources, &aggregate_dir, mode, keep_batches)
        } else {
            tracing::warn!(target = %aggregate_dir.display(), "writing aggregate in place");
            self.merge_to(&sources, &aggregate_dir, mode, keep_batches)
                .map(|(merged, failed, chunks)| MergeOutcome {
                    merged,
                    failed,
                    chunks,
                    backup_dir: None,
                })
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(corpus = %corpus_dir.display(), error = %err, "merge failed, manifest left unchanged");
                return Err(err);
            }
        };

        if outcome.failed > 0 {
            // Track only what actually reached the aggregate so the next
            // scan sees the difference and retries.
            let tracking = manifest.apply_tracking(&outcome.merged, scanner.hasher())?;
            report.concatenated_hash = tracking.concat_hash;
        }
        manifest.mark_merged();
        manifest.save(&manifest_path)?;

        report.merged = true;
        report.sources_merged = outcome.merged.len();
        report.sources_failed = outcome.failed;
        report.chunks = outcome.chunks;
        report.backup_dir = outcome.backup_dir;
        report.elapsed_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            corpus = %corpus_dir.display(),
            sources = report.sources_merged,
            failed = report.sources_failed,
            chunks = report.chunks,
            mode = ?mode,
            elapsed_secs = report.elapsed_secs,
            "aggregate merged"
        );
        Ok(report)
    }

    /// Build the aggregate in a temp sibling and swap it into place.
    fn merge_atomic(
        &self,
        sources: &[ArtifactRef],
        target: &Path,
        mode: MergeMode,
        keep_batches: bool,
    ) -> Result<MergeOutcome> {
        let writer = AtomicMergeWriter::new();
        let temp = writer.create_temp_dir(target)?;
        let result = self
            .merge_to(sources, &temp, mode, keep_batches)
            .and_then(|(merged, failed, chunks)| {
                let replaced = writer.replace(&temp, target, self.config.merge.backup)?;
                Ok(MergeOutcome {
                    merged,
                    failed,
                    chunks,
                    backup_dir: replaced.backup_dir,
                })
            });
        if result.is_err() {
            writer.cleanup_temp_dir(&temp);
        }
        result
    }

    /// Merge `sources` into `output`. Returns the sources that made it in,
    /// the failure count, and the chunk count.
    fn merge_to(
        &self,
        sources: &[ArtifactRef],
        output: &Path,
        mode: MergeMode,
        keep_batches: bool,
    ) -> Result<(Vec<ArtifactRef>, usize, usize)> {
        let dirs: Vec<PathBuf> = sources.iter().map(|s| s.dir.clone()).collect();
        let (failed, chunks): (Vec<PathBuf>, usize) = match mode {
            MergeMode::Direct => {
                let tally = merge_sources(&dirs, output)?;
                (tally.failed.into_iter().map(|(p, _)| p).collect(), tally.chunks)
            }
            MergeMode::Batch { batch_size } => {
                let report = BatchMerger::new(batch_size)
                    .keep_batches(keep_batches)
                    .with_progress(self.progress.clone())
                    .merge_all(&dirs, output)?;
                if let Some(work_dir) = &report.work_dir {
                    tracing::info!(dir = %work_dir.display(), "batch artifacts kept");
                }
                (report.failed.into_iter().map(|(p, _)| p).collect(), report.chunks)
            }
        };
        let merged: Vec<ArtifactRef> = sources
            .iter()
            .filter(|s| !failed.contains(&s.dir))
            .cloned()
            .collect();
        Ok((merged, failed.len(), chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::hashing::concatenated_hash;
    use crate::loader::FileLoader;

    fn orchestrator(config: &Config) -> MergeOrchestrator {
        MergeOrchestrator::new(
            config.clone(),
            Arc::new(FileLoader::new(&config.chunking)),
            Arc::new(HashEmbedder::new(32)),
        )
    }

    fn corpus(docs: &[(&str, &str)]) -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        for (name, body) in docs {
            std::fs::write(tmp.path().join(name), body).unwrap();
        }
        tmp
    }

    fn aggregate_sources(config: &Config, dir: &Path) -> Vec<String> {
        let mut sources: Vec<String> = artifact::FlatIndex::load(&config.corpus.aggregate_dir(dir))
            .unwrap()
            .chunks()
            .iter()
            .map(|c| c.source_file.clone())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }

    #[test]
    fn first_sync_builds_and_records() {
        let tmp = corpus(&[("a.txt", "alpha text"), ("b.txt", "beta text"), ("c.md", "gamma")]);
        let config = Config::for_corpus(tmp.path());
        let report = orchestrator(&config)
            .sync(tmp.path(), &MergeOptions::default())
            .unwrap();

        assert_eq!(report.state, CorpusState::Initial);
        assert_eq!(report.built, 3);
        assert!(report.merged);
        assert_eq!(report.mode, Some(MergeMode::Direct));
        assert_eq!(aggregate_sources(&config, tmp.path()), vec!["a.txt", "b.txt", "c.md"]);

        let manifest = Manifest::load(&Manifest::path_in(tmp.path())).unwrap();
        assert_eq!(manifest.files.len(), 3);
        let hashes: Vec<&String> = manifest.merge_tracking.indexes.keys().collect();
        assert_eq!(manifest.merge_tracking.concat_hash, concatenated_hash(hashes));
        assert!(manifest.merge_tracking.last_merged_at.is_some());
    }

    #[test]
    fn unchanged_corpus_skips_merge() {
        let tmp = corpus(&[("a.txt", "alpha"), ("b.txt", "beta")]);
        let config = Config::for_corpus(tmp.path());
        let orch = orchestrator(&config);
        let first = orch.sync(tmp.path(), &MergeOptions::default()).unwrap();
        let second = orch.sync(tmp.path(), &MergeOptions::default()).unwrap();

        assert_eq!(second.state, CorpusState::Unchanged);
        assert!(!second.merged);
        assert_eq!(second.cached, 2);
        assert_eq!(second.built, 0);
        assert_eq!(first.concatenated_hash, second.concatenated_hash);

        let forced = orch
            .sync(
                tmp.path(),
                &MergeOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(forced.merged);
        assert!(forced.backup_dir.is_some());
    }

    #[test]
    fn dry_run_writes_nothing() {
        let tmp = corpus(&[("a.txt", "alpha"), ("b.txt", "beta")]);
        let config = Config::for_corpus(tmp.path());
        let report = orchestrator(&config)
            .sync(
                tmp.path(),
                &MergeOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(report.state, CorpusState::Initial);
        assert_eq!(report.delta.added, vec!["a.txt", "b.txt"]);
        assert!(!report.merged);
        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn read_only_corpus_is_never_rebuilt() {
        let tmp = corpus(&[("a.txt", "alpha")]);
        let mut config = Config::for_corpus(tmp.path());
        config.corpus.read_only = vec![tmp.path().to_path_buf()];
        let report = orchestrator(&config)
            .sync(tmp.path(), &MergeOptions::default())
            .unwrap();
        assert!(report.read_only);
        assert!(!report.merged);
        assert!(!config.corpus.aggregate_dir(tmp.path()).exists());
    }

    #[test]
    fn failed_replace_keeps_manifest_and_old_aggregate() {
        let tmp = corpus(&[("a.txt", "alpha")]);
        let config = Config::for_corpus(tmp.path());
        let orch = orchestrator(&config);
        orch.sync(tmp.path(), &MergeOptions::default()).unwrap();
        let before = Manifest::load(&Manifest::path_in(tmp.path())).unwrap();

        // A file where the backup set should go makes the replace fail.
        let aggregate = config.corpus.aggregate_dir(tmp.path());
        std::fs::write(crate::atomic::backup_root(&aggregate), "blocker").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "beta").unwrap();

        let err = orch.sync(tmp.path(), &MergeOptions::default()).unwrap_err();
        assert!(matches!(err, IndexError::AtomicReplace { .. }), "{err}");
        let after = Manifest::load(&Manifest::path_in(tmp.path())).unwrap();
        assert_eq!(
            after.merge_tracking.concat_hash,
            before.merge_tracking.concat_hash
        );
        assert_eq!(aggregate_sources(&config, tmp.path()), vec!["a.txt"]);
        let temps = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".merge-"))
            .count();
        assert_eq!(temps, 0);

        std::fs::remove_file(crate::atomic::backup_root(&aggregate)).unwrap();
        let retry = orch.sync(tmp.path(), &MergeOptions::default()).unwrap();
        assert_eq!(retry.state, CorpusState::Changed);
        assert!(retry.merged);
        assert_eq!(aggregate_sources(&config, tmp.path()), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn batch_mode_when_requested_or_over_threshold() {
        let tmp = corpus(&[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c"), ("d.txt", "d")]);
        let mut config = Config::for_corpus(tmp.path());
        let report = orchestrator(&config)
            .sync(
                tmp.path(),
                &MergeOptions {
                    batch_size: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(report.mode, Some(MergeMode::Batch { batch_size: 2 }));
        assert_eq!(report.sources_merged, 4);

        config.merge.batch_threshold = 3;
        config.merge.batch_size = 3;
        let report = orchestrator(&config)
            .sync(
                tmp.path(),
                &MergeOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(report.mode, Some(MergeMode::Batch { batch_size: 3 }));
        assert_eq!(aggregate_sources(&config, tmp.path()).len(), 4);
    }

    #[test]
    fn unreadable_document_is_reported_not_fatal() {
        let tmp = corpus(&[("a.txt", "alpha"), ("empty.txt", "   ")]);
        let config = Config::for_corpus(tmp.path());
        let report = orchestrator(&config)
            .sync(tmp.path(), &MergeOptions::default())
            .unwrap();
        assert_eq!(report.built, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "empty.txt");
        assert!(report.merged);
    }

    #[test]
    fn missing_corpus_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        let config = Config::for_corpus(&missing);
        let err = orchestrator(&config)
            .sync(&missing, &MergeOptions::default())
            .unwrap_err();
        assert!(matches!(err, IndexError::NotFound(_)));
        assert!(!missing.exists());
    }
}
