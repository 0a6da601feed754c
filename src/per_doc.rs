//! Content-addressed per-document artifacts.
//!
//! Each document gets its own artifact folder named by its content hash:
//!
//! ```text
//! <cache_root>/<content_hash>/
//!   index.vec        vectors
//!   index.json       docstore
//!   manifest.json    {version, files: {<name>: {content_hash, size, mtime}}}
//!   metadata.json    filename, size, trained_at, chunk count
//! ```
//!
//! A folder is built in a hidden staging sibling and renamed into place, so a
//! crash mid-build never leaves a folder that [`PerDocumentCache::ensure`]
//! would later accept.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::artifact::{self, FlatIndex};
use crate::embedding::Embedder;
use crate::error::{IndexError, Result};
use crate::fsutil::{atomic_write, dir_size, remove_dir_best_effort, unique_sibling};
use crate::hashing::is_content_hash;
use crate::loader::DocumentLoader;
use crate::manifest::{now_rfc3339, FileState, Manifest};
use crate::models::{ArtifactRef, Document};

pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMetadata {
    pub filename: String,
    pub content_hash: String,
    pub file_size: u64,
    pub trained_at: String,
    pub chunks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureStatus {
    /// A valid artifact already existed; nothing was built.
    Cached,
    Built,
}

#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    pub artifact: ArtifactRef,
    pub status: EnsureStatus,
    pub chunks: Option<usize>,
    pub elapsed: Duration,
}

pub struct PerDocumentCache {
    root: PathBuf,
    loader: Arc<dyn DocumentLoader>,
    embedder: Arc<dyn Embedder>,
}

impl PerDocumentCache {
    pub fn new(
        root: impl Into<PathBuf>,
        loader: Arc<dyn DocumentLoader>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            root: root.into(),
            loader,
            embedder,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_dir(&self, content_hash: &str) -> PathBuf {
        self.root.join(content_hash)
    }

    pub fn is_built(&self, content_hash: &str) -> bool {
        artifact::is_valid_dir(&self.artifact_dir(content_hash))
    }

    /// Return the artifact for `doc`, building it only if no valid one exists.
    pub fn ensure(&self, doc: &Document) -> Result<EnsureOutcome> {
        self.ensure_with(doc, false)
    }

    /// Build `doc` again even if a valid artifact exists.
    pub fn rebuild(&self, doc: &Document) -> Result<EnsureOutcome> {
        self.ensure_with(doc, true)
    }

    fn ensure_with(&self, doc: &Document, force: bool) -> Result<EnsureOutcome> {
        let started = Instant::now();
        let dir = self.artifact_dir(&doc.content_hash);
        let artifact_ref = ArtifactRef {
            content_hash: doc.content_hash.clone(),
            dir: dir.clone(),
        };

        if !force && artifact::is_valid_dir(&dir) {
            tracing::debug!(document = %doc.name, hash = %doc.content_hash, "artifact cached");
            return Ok(EnsureOutcome {
                artifact: artifact_ref,
                status: EnsureStatus::Cached,
                chunks: None,
                elapsed: started.elapsed(),
            });
        }

        let chunks = self.build_into_place(doc, &dir)?;
        tracing::info!(
            document = %doc.name,
            hash = %doc.content_hash,
            chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "artifact built"
        );
        Ok(EnsureOutcome {
            artifact: artifact_ref,
            status: EnsureStatus::Built,
            chunks: Some(chunks),
            elapsed: started.elapsed(),
        })
    }

    fn build_into_place(&self, doc: &Document, dir: &Path) -> Result<usize> {
        std::fs::create_dir_all(&self.root)?;
        let staging = unique_sibling(dir, "staging");

        let chunks = match self.build_staging(doc, &staging) {
            Ok(chunks) => chunks,
            Err(err) => {
                remove_dir_best_effort(&staging);
                return Err(err);
            }
        };

        // An existing folder is either invalid or being force-rebuilt.
        let displaced = if dir.exists() {
            let stale = unique_sibling(dir, "stale");
            if let Err(err) = std::fs::rename(dir, &stale) {
                remove_dir_best_effort(&staging);
                return Err(err.into());
            }
            Some(stale)
        } else {
            None
        };

        if let Err(err) = std::fs::rename(&staging, dir) {
            if let Some(stale) = &displaced {
                if let Err(restore_err) = std::fs::rename(stale, dir) {
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %restore_err,
                        "could not restore previous artifact folder"
                    );
                }
            }
            remove_dir_best_effort(&staging);
            return Err(err.into());
        }

        if let Some(stale) = displaced {
            remove_dir_best_effort(&stale);
        }
        Ok(chunks)
    }

    fn build_staging(&self, doc: &Document, staging: &Path) -> Result<usize> {
        let chunks = self.loader.load_and_split(&doc.path)?;
        let index = FlatIndex::build(&chunks, self.embedder.as_ref())?;
        index.save(staging)?;

        let mut manifest = Manifest::new();
        manifest.files.insert(
            doc.name.clone(),
            FileState {
                size: doc.size,
                mtime: doc.mtime,
                content_hash: doc.content_hash.clone(),
            },
        );
        manifest.save(&Manifest::path_in(staging))?;

        let metadata = DocMetadata {
            filename: doc.name.clone(),
            content_hash: doc.content_hash.clone(),
            file_size: doc.size,
            trained_at: now_rfc3339(),
            chunks: index.len(),
        };
        atomic_write(
            &staging.join(METADATA_FILE),
            &serde_json::to_vec_pretty(&metadata)?,
        )?;
        Ok(index.len())
    }
}

/// A per-document folder found on disk.
#[derive(Debug, Clone)]
pub struct CachedDocument {
    pub content_hash: String,
    pub dir: PathBuf,
    pub valid: bool,
    pub metadata: Option<DocMetadata>,
    pub bytes: u64,
}

impl CachedDocument {
    pub fn display_name(&self) -> String {
        self.metadata
            .as_ref()
            .map(|m| m.filename.clone())
            .or_else(|| display_name_from_manifest(&self.dir))
            .unwrap_or_else(|| self.content_hash.clone())
    }
}

/// Original filename recorded in `<dir>/manifest.json`, if any.
pub fn display_name_from_manifest(dir: &Path) -> Option<String> {
    let bytes = std::fs::read(Manifest::path_in(dir)).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let manifest = Manifest::migrate(value).ok()?;
    manifest.files.keys().next().cloned()
}

fn hash_folders(cache_root: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !cache_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut folders = Vec::new();
    for entry in std::fs::read_dir(cache_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_content_hash(&name) {
            folders.push((name, entry.path()));
        }
    }
    folders.sort();
    Ok(folders)
}

/// Every content-hash folder under `cache_root`, sorted by hash.
pub fn list_cached(cache_root: &Path) -> Result<Vec<CachedDocument>> {
    hash_folders(cache_root)?
        .into_iter()
        .map(|(content_hash, dir)| {
            let metadata = std::fs::read(dir.join(METADATA_FILE))
                .ok()
                .and_then(|b| serde_json::from_slice(&b).ok());
            Ok(CachedDocument {
                valid: artifact::is_valid_dir(&dir),
                bytes: dir_size(&dir),
                content_hash,
                dir,
                metadata,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanEntry {
    pub content_hash: String,
    pub dir: PathBuf,
    pub bytes: u64,
}

/// Hash folders whose document no longer exists in the corpus.
#[derive(Debug, Clone, Default)]
pub struct OrphanSet {
    pub entries: Vec<OrphanEntry>,
    /// Folders that still belong to a live document.
    pub kept: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanCleanup {
    pub removed: usize,
    pub failed: usize,
    pub reclaimed_bytes: u64,
}

impl OrphanSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes).sum()
    }

    pub fn requires_confirmation(&self, threshold: usize) -> bool {
        self.entries.len() > threshold
    }

    /// Delete every orphan folder.
    ///
    /// More than `threshold` folders require `confirmed`; otherwise nothing
    /// is touched and [`IndexError::ConfirmationRequired`] is returned.
    pub fn remove(&self, confirmed: bool, threshold: usize) -> Result<OrphanCleanup> {
        if self.requires_confirmation(threshold) && !confirmed {
            return Err(IndexError::ConfirmationRequired {
                count: self.entries.len(),
            });
        }
        let mut report = OrphanCleanup::default();
        for entry in &self.entries {
            match std::fs::remove_dir_all(&entry.dir) {
                Ok(()) => {
                    tracing::info!(hash = %entry.content_hash, bytes = entry.bytes, "removed orphan");
                    report.removed += 1;
                    report.reclaimed_bytes += entry.bytes;
                }
                Err(err) => {
                    tracing::warn!(dir = %entry.dir.display(), error = %err, "failed to remove orphan");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Hash folders under `cache_root` not named by any hash in `live`.
pub fn find_orphans(cache_root: &Path, live: &BTreeSet<String>) -> Result<OrphanSet> {
    let mut set = OrphanSet::default();
    for (content_hash, dir) in hash_folders(cache_root)? {
        if live.contains(&content_hash) {
            set.kept += 1;
            continue;
        }
        set.entries.push(OrphanEntry {
            bytes: dir_size(&dir),
            content_hash,
            dir,
        });
    }
    Ok(set)
}
