//! Manifest persistence and change detection.
//!
//! A corpus manifest (`<corpus>/manifest.json`) records what every tracked
//! document looked like at the last scan and which per-document artifacts
//! fed the last merge:
//!
//! ```json
//! {
//!   "version": 2,
//!   "created_at": "...",
//!   "updated_at": "...",
//!   "files": { "paper.pdf": { "size": 1024, "mtime": 1.7e9, "content_hash": "..." } },
//!   "merge_tracking": {
//!     "indexes": { "<doc_hash>": { "source_path": "...", "index_hash": "...", "last_checked": "..." } },
//!     "all_hashes_concatenated": "...",
//!     "concat_md5": "...",
//!     "last_merged_at": "..."
//!   }
//! }
//! ```
//!
//! Older layouts are migrated on load. Every save first copies the previous
//! file to `manifest.json.backup`, then writes through a temp file + rename.

use chrono::{SecondsFormat, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::artifact;
use crate::config::Config;
use crate::error::{IndexError, Result};
use crate::fsutil::{atomic_write, mtime_secs};
use crate::hashing::{concatenate_sorted, concatenated_hash, hash_bytes, ContentHasher};
use crate::models::{ArtifactRef, Document};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 2;

/// mtimes round-trip through JSON as decimal text.
const MTIME_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    pub size: u64,
    pub mtime: f64,
    #[serde(alias = "md5", alias = "hash")]
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub index_hash: String,
    #[serde(default)]
    pub last_checked: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergeTracking {
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexEntry>,
    #[serde(default)]
    pub all_hashes_concatenated: String,
    #[serde(default, rename = "concat_md5")]
    pub concat_hash: String,
    #[serde(default)]
    pub last_merged_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
    #[serde(default)]
    pub merge_tracking: MergeTracking,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Outcome of refreshing merge tracking against the current artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingUpdate {
    pub indexes_changed: bool,
    pub concat_changed: bool,
    pub concat_hash: String,
}

impl Manifest {
    pub fn new() -> Self {
        let now = now_rfc3339();
        Self {
            version: MANIFEST_VERSION,
            created_at: now.clone(),
            updated_at: now,
            files: BTreeMap::new(),
            merge_tracking: MergeTracking::default(),
        }
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    pub fn backup_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }

    /// Load a manifest, migrating older layouts.
    ///
    /// A missing file yields a fresh manifest. An unreadable file falls back
    /// to its backup, then to a fresh manifest; both cases are logged since
    /// they force a full rescan.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no manifest yet");
            return Ok(Self::new());
        }
        match Self::read(path) {
            Ok(manifest) => Ok(manifest),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "manifest unreadable, trying backup");
                let backup = Self::backup_path(path);
                match Self::read(&backup) {
                    Ok(manifest) => Ok(manifest),
                    Err(backup_err) => {
                        tracing::warn!(
                            path = %backup.display(),
                            error = %backup_err,
                            "manifest backup unusable, starting fresh"
                        );
                        Ok(Self::new())
                    }
                }
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        Self::migrate(value).map_err(|e| IndexError::corrupt(path, e.to_string()))
    }

    /// Convert any known manifest layout to the current one.
    ///
    /// | Layout | Recognized by |
    /// |--------|---------------|
    /// | current / v1 | `merge_tracking` key |
    /// | pre-versioned merge tracker | top-level `indexes` |
    /// | per-directory file list | top-level `files` only |
    pub fn migrate(value: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(mut map) = value else {
            return Err(IndexError::InvalidInput("manifest is not a JSON object".into()));
        };

        let created_at = map
            .get("created_at")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(now_rfc3339);
        let updated_at = map
            .get("updated_at")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| created_at.clone());
        let stored_version = map.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        if stored_version > u64::from(MANIFEST_VERSION) {
            tracing::warn!(
                version = stored_version,
                supported = MANIFEST_VERSION,
                "manifest written by a newer version; unknown fields are ignored"
            );
        }

        let files: BTreeMap<String, FileState> = match map.remove("files") {
            Some(v) => serde_json::from_value(v)?,
            None => BTreeMap::new(),
        };

        let merge_tracking = if let Some(v) = map.remove("merge_tracking") {
            serde_json::from_value(v)?
        } else if let Some(v) = map.remove("indexes") {
            tracing::info!("migrating pre-versioned manifest layout");
            MergeTracking {
                indexes: serde_json::from_value(v)?,
                ..MergeTracking::default()
            }
        } else {
            MergeTracking::default()
        };

        Ok(Self {
            version: MANIFEST_VERSION,
            created_at,
            updated_at,
            files,
            merge_tracking,
        })
    }

    /// Back up the existing file, then write this manifest atomically.
    /// Returns the backup path when a previous file existed.
    pub fn save(&mut self, path: &Path) -> Result<Option<PathBuf>> {
        self.version = MANIFEST_VERSION;
        self.updated_at = now_rfc3339();

        let backup = if path.is_file() {
            let backup = Self::backup_path(path);
            std::fs::copy(path, &backup)?;
            Some(backup)
        } else {
            None
        };

        let body = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &body)?;
        tracing::debug!(path = %path.display(), "manifest saved");
        Ok(backup)
    }

    /// Stable digest of the tracked state. Unchanged content always yields the
    /// same fingerprint regardless of timestamps.
    pub fn fingerprint(&self) -> String {
        let mut parts = Vec::new();
        for (name, state) in &self.files {
            parts.push(format!("f:{name}:{}", state.content_hash));
        }
        for (hash, entry) in &self.merge_tracking.indexes {
            parts.push(format!("i:{hash}:{}", entry.index_hash));
        }
        parts.push(format!("c:{}", self.merge_tracking.concat_hash));
        hash_bytes(parts.join("\n").as_bytes())
    }

    /// Refresh merge tracking from the artifacts that will feed the merge.
    ///
    /// Entries for artifacts no longer present are dropped; the concatenated
    /// hash is recomputed over the remaining document hashes.
    pub fn apply_tracking(
        &mut self,
        artifacts: &[ArtifactRef],
        hasher: &ContentHasher,
    ) -> Result<TrackingUpdate> {
        let now = now_rfc3339();
        let mut indexes = BTreeMap::new();
        let mut indexes_changed = false;

        for artifact_ref in artifacts {
            let Some(index_hash) = artifact::index_hash(&artifact_ref.dir, hasher)? else {
                tracing::warn!(dir = %artifact_ref.dir.display(), "artifact files missing, not tracked");
                continue;
            };
            let previous = self.merge_tracking.indexes.get(&artifact_ref.content_hash);
            if previous.map(|p| p.index_hash.as_str()) != Some(index_hash.as_str()) {
                indexes_changed = true;
            }
            indexes.insert(
                artifact_ref.content_hash.clone(),
                IndexEntry {
                    source_path: artifact_ref.dir.display().to_string(),
                    index_hash,
                    last_checked: now.clone(),
                },
            );
        }
        if indexes.len() != self.merge_tracking.indexes.len() {
            indexes_changed = true;
        }

        let all = concatenate_sorted(indexes.keys());
        let concat = concatenated_hash(indexes.keys());
        let concat_changed = concat != self.merge_tracking.concat_hash;

        self.merge_tracking.indexes = indexes;
        self.merge_tracking.all_hashes_concatenated = all;
        self.merge_tracking.concat_hash = concat.clone();

        Ok(TrackingUpdate {
            indexes_changed,
            concat_changed,
            concat_hash: concat,
        })
    }

    pub fn mark_merged(&mut self) {
        self.merge_tracking.last_merged_at = Some(now_rfc3339());
    }
}

/// Fingerprint of `<dir>/manifest.json`, or `None` if there is no manifest.
pub fn manifest_fingerprint(dir: &Path) -> Result<Option<String>> {
    let path = Manifest::path_in(dir);
    if !path.is_file() {
        return Ok(None);
    }
    Ok(Some(Manifest::read(&path)?.fingerprint()))
}

/// Documents added, removed, or modified since the previous manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManifestDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub concatenated_hash_changed: bool,
}

impl ManifestDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} added, {} removed, {} modified",
            self.added.len(),
            self.removed.len(),
            self.modified.len()
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Ignore cached (size, mtime) hashes and hash every file again.
    pub force_rehash: bool,
    /// Only consider the first N discovered documents.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CorpusScan {
    pub documents: Vec<Document>,
    pub files: BTreeMap<String, FileState>,
    pub delta: ManifestDelta,
    pub concatenated_hash: String,
    pub rehashed: usize,
    /// Files that could not be read, with the reason.
    pub failures: Vec<(String, String)>,
}

/// Discovers documents in a corpus directory and classifies changes.
pub struct CorpusScanner {
    include: GlobSet,
    exclude: GlobSet,
    recursive: bool,
    hasher: ContentHasher,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}

impl CorpusScanner {
    pub fn new(
        include: &[String],
        exclude: &[String],
        recursive: bool,
        hasher: ContentHasher,
    ) -> Result<Self> {
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
            recursive,
            hasher,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.corpus.include_globs,
            &config.corpus.exclude_globs,
            config.corpus.recursive,
            ContentHasher::new(config.merge.hash_chunk_size),
        )
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    /// Matching document paths relative to `corpus_dir`, sorted.
    ///
    /// Hidden entries and content-hash folders are never descended into.
    pub fn discover(&self, corpus_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        if !corpus_dir.is_dir() {
            return Err(IndexError::NotFound(format!(
                "corpus directory {}",
                corpus_dir.display()
            )));
        }
        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let mut found = Vec::new();

        let walker = WalkDir::new(corpus_dir)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.')
                    && !(e.file_type().is_dir() && crate::hashing::is_content_hash(&name))
            });

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(corpus_dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if rel == MANIFEST_FILE || rel.ends_with(".backup") {
                continue;
            }
            if self.include.is_match(&rel) && !self.exclude.is_match(&rel) {
                found.push((rel, entry.path().to_path_buf()));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Hash the corpus and compare it with `previous`.
    pub fn scan(
        &self,
        corpus_dir: &Path,
        previous: &Manifest,
        options: &ScanOptions,
    ) -> Result<CorpusScan> {
        let mut discovered = self.discover(corpus_dir)?;
        if let Some(limit) = options.limit {
            discovered.truncate(limit);
        }

        let mut documents = Vec::with_capacity(discovered.len());
        let mut files = BTreeMap::new();
        let mut failures = Vec::new();
        let mut rehashed = 0;

        for (name, path) in discovered {
            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::warn!(file = %name, error = %err, "cannot stat document");
                    failures.push((name, err.to_string()));
                    continue;
                }
            };
            let size = meta.len();
            let mtime = mtime_secs(&meta);

            let reused = previous.files.get(&name).filter(|prev| {
                !options.force_rehash
                    && prev.size == size
                    && (prev.mtime - mtime).abs() < MTIME_TOLERANCE
                    && !prev.content_hash.is_empty()
            });
            let content_hash = match reused {
                Some(prev) => prev.content_hash.clone(),
                None => match self.hasher.hash_file(&path) {
                    Ok(hash) => {
                        rehashed += 1;
                        hash
                    }
                    Err(err) => {
                        tracing::warn!(file = %name, error = %err, "cannot hash document");
                        failures.push((name, err.to_string()));
                        continue;
                    }
                },
            };

            files.insert(
                name.clone(),
                FileState {
                    size,
                    mtime,
                    content_hash: content_hash.clone(),
                },
            );
            documents.push(Document {
                name,
                path,
                size,
                mtime,
                content_hash,
            });
        }

        let concatenated_hash = concatenated_hash(documents.iter().map(|d| &d.content_hash));
        let delta = diff(previous, &files, &concatenated_hash);
        tracing::debug!(
            documents = documents.len(),
            rehashed,
            changes = %delta.summary(),
            "corpus scanned"
        );

        Ok(CorpusScan {
            documents,
            files,
            delta,
            concatenated_hash,
            rehashed,
            failures,
        })
    }
}

fn diff(previous: &Manifest, current: &BTreeMap<String, FileState>, concat: &str) -> ManifestDelta {
    let mut delta = ManifestDelta::default();
    for (name, state) in current {
        match previous.files.get(name) {
            None => delta.added.push(name.clone()),
            Some(prev) if prev.content_hash != state.content_hash => {
                delta.modified.push(name.clone())
            }
            Some(_) => {}
        }
    }
    let current_names: BTreeSet<&String> = current.keys().collect();
    delta.removed = previous
        .files
        .keys()
        .filter(|name| !current_names.contains(name))
        .cloned()
        .collect();
    delta.concatenated_hash_changed = concat != previous.merge_tracking.concat_hash;
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scanner() -> CorpusScanner {
        CorpusScanner::from_config(&Config::default()).unwrap()
    }

    fn scan_and_record(dir: &Path, manifest: &mut Manifest) -> CorpusScan {
        let scan = scanner()
            .scan(dir, manifest, &ScanOptions::default())
            .unwrap();
        manifest.files = scan.files.clone();
        manifest.merge_tracking.concat_hash = scan.concatenated_hash.clone();
        scan
    }

    #[test]
    fn test_unchanged_corpus_is_stable() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "alpha").unwrap();
        fs::write(tmp.path().join("b.md"), "beta").unwrap();
        let mut manifest = Manifest::new();
        let first = scan_and_record(tmp.path(), &mut manifest);
        assert_eq!(first.delta.added, vec!["a.txt", "b.md"]);
        assert!(first.delta.concatenated_hash_changed);

        let second = scan_and_record(tmp.path(), &mut manifest);
        assert!(second.delta.is_empty());
        assert!(!second.delta.concatenated_hash_changed);
        assert_eq!(second.rehashed, 0);
        assert_eq!(first.concatenated_hash, second.concatenated_hash);
    }

    #[test]
    fn test_add_remove_modify_are_classified() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "alpha").unwrap();
        fs::write(tmp.path().join("b.txt"), "beta").unwrap();
        fs::write(tmp.path().join("c.txt"), "gamma").unwrap();
        let mut manifest = Manifest::new();
        let before = scan_and_record(tmp.path(), &mut manifest);

        fs::remove_file(tmp.path().join("b.txt")).unwrap();
        fs::write(tmp.path().join("c.txt"), "gamma, revised and longer").unwrap();
        fs::write(tmp.path().join("d.txt"), "delta").unwrap();

        let after = scanner()
            .scan(tmp.path(), &manifest, &ScanOptions::default())
            .unwrap();
        assert_eq!(after.delta.added, vec!["d.txt"]);
        assert_eq!(after.delta.removed, vec!["b.txt"]);
        assert_eq!(after.delta.modified, vec!["c.txt"]);
        assert!(after.delta.concatenated_hash_changed);
        assert_ne!(before.concatenated_hash, after.concatenated_hash);
    }

    #[test]
    fn test_forced_rehash_matches_cached_hashes() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "alpha").unwrap();
        let mut manifest = Manifest::new();
        let cached = scan_and_record(tmp.path(), &mut manifest);
        let forced = scanner()
            .scan(
                tmp.path(),
                &manifest,
                &ScanOptions {
                    force_rehash: true,
                    limit: None,
                },
            )
            .unwrap();
        assert_eq!(forced.rehashed, 1);
        assert_eq!(cached.concatenated_hash, forced.concatenated_hash);
    }

    #[test]
    fn test_discover_skips_hidden_hash_dirs_and_manifest() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "alpha").unwrap();
        fs::write(tmp.path().join("image.png"), "png").unwrap();
        fs::write(tmp.path().join(MANIFEST_FILE), "{}").unwrap();
        let hash_dir = tmp.path().join("0123456789abcdef0123456789abcdef");
        fs::create_dir(&hash_dir).unwrap();
        fs::write(hash_dir.join("inner.txt"), "x").unwrap();
        fs::create_dir(tmp.path().join(".mini_rag_index")).unwrap();

        let found = scanner().discover(tmp.path()).unwrap();
        let names: Vec<_> = found.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[test]
    fn test_limit_truncates_in_sorted_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        for name in ["c.txt", "a.txt", "b.txt"] {
            fs::write(tmp.path().join(name), name).unwrap();
        }
        let scan = scanner()
            .scan(
                tmp.path(),
                &Manifest::new(),
                &ScanOptions {
                    force_rehash: false,
                    limit: Some(2),
                },
            )
            .unwrap();
        let names: Vec<_> = scan.documents.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_save_backs_up_previous_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = Manifest::path_in(tmp.path());
        let mut manifest = Manifest::new();
        assert_eq!(manifest.save(&path).unwrap(), None);

        manifest.merge_tracking.concat_hash = "abc".into();
        let backup = manifest.save(&path).unwrap().unwrap();
        let old: Manifest = serde_json::from_slice(&fs::read(&backup).unwrap()).unwrap();
        assert_eq!(old.merge_tracking.concat_hash, "");
        let new = Manifest::load(&path).unwrap();
        assert_eq!(new.merge_tracking.concat_hash, "abc");

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["merge_tracking"]["concat_md5"], "abc");
        assert_eq!(raw["version"], MANIFEST_VERSION);
    }

    #[test]
    fn test_migrates_pre_versioned_layout() {
        let value = serde_json::json!({
            "indexes": {
                "0123456789abcdef0123456789abcdef": {
                    "source_path": "/c/0123456789abcdef0123456789abcdef",
                    "index_hash": "ff"
                }
            }
        });
        let manifest = Manifest::migrate(value).unwrap();
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.merge_tracking.indexes.len(), 1);
        assert_eq!(manifest.merge_tracking.concat_hash, "");
    }

    #[test]
    fn test_migrates_v1_and_file_list_layouts() {
        let v1 = serde_json::json!({
            "version": 1,
            "created_at": "2024-01-01T00:00:00",
            "merge_tracking": {"indexes": {}, "concat_md5": "aa", "all_hashes_concatenated": ""}
        });
        let manifest = Manifest::migrate(v1).unwrap();
        assert_eq!(manifest.created_at, "2024-01-01T00:00:00");
        assert_eq!(manifest.merge_tracking.concat_hash, "aa");
        assert!(manifest.files.is_empty());

        let file_list = serde_json::json!({
            "version": 1,
            "files": {"a.pdf": {"size": 3, "mtime": 12.5, "md5": "deadbeef"}}
        });
        let manifest = Manifest::migrate(file_list).unwrap();
        assert_eq!(manifest.files["a.pdf"].content_hash, "deadbeef");
        assert_eq!(manifest.files["a.pdf"].mtime, 12.5);
    }

    #[test]
    fn test_corrupt_manifest_falls_back_to_backup() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = Manifest::path_in(tmp.path());
        let mut manifest = Manifest::new();
        manifest.merge_tracking.concat_hash = "first".into();
        manifest.save(&path).unwrap();
        manifest.merge_tracking.concat_hash = "second".into();
        manifest.save(&path).unwrap();
        fs::write(&path, "{ truncated").unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded.merge_tracking.concat_hash, "first");
    }

    #[test]
    fn test_fingerprint_ignores_timestamps() {
        let mut a = Manifest::new();
        a.files.insert(
            "a.txt".into(),
            FileState {
                size: 1,
                mtime: 1.0,
                content_hash: "h1".into(),
            },
        );
        let mut b = a.clone();
        b.updated_at = "2030-01-01T00:00:00Z".into();
        b.files.get_mut("a.txt").unwrap().mtime = 99.0;
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.files.get_mut("a.txt").unwrap().content_hash = "h2".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
