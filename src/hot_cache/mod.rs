//! Ephemeral cache of deserialized artifacts.
//!
//! Entries live in a fast machine-local directory (tmpfs when available) as a
//! pair of files:
//!
//! ```text
//! <dir>/<prefix>_<key>.blob   bincode: format version, then the FlatIndex
//! <dir>/<prefix>_<key>.meta   JSON: manifest_hash, corpus_path, save_time, cache_key
//! ```
//!
//! `key` is the first 16 hex characters of `hash(corpus_path + "::" +
//! manifest_hash)`. The manifest hash covers the source's manifest
//! fingerprint and its artifact build id, so any rebuild or document change
//! yields a different key and the old entry can never be served.
//!
//! The cache only saves latency. Every failure (full store, unreadable entry,
//! format change) degrades to a miss.

mod cleanup;
pub mod validator;

pub use cleanup::CacheStats;
pub use validator::{FsSpaceProbe, SpacePolicy, SpaceProbe, SpaceRefusal, StoreUsage};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::artifact::{self, FlatIndex};
use crate::config::CacheConfig;
use crate::error::{IndexError, Result};
use crate::fsutil::{atomic_write, remove_file_best_effort};
use crate::hashing::hash_bytes;
use crate::manifest::manifest_fingerprint;

pub const BLOB_FORMAT_VERSION: u32 = 1;
const BLOB_EXT: &str = "blob";
const META_EXT: &str = "meta";
const KEY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub corpus_path: PathBuf,
    pub manifest_hash: String,
    pub key: String,
}

impl CacheKey {
    pub fn derive(corpus_path: &Path, manifest_hash: &str) -> Self {
        let digest = hash_bytes(format!("{}::{}", corpus_path.display(), manifest_hash).as_bytes());
        Self {
            corpus_path: corpus_path.to_path_buf(),
            manifest_hash: manifest_hash.to_string(),
            key: digest[..KEY_LEN].to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub format_version: u32,
    pub manifest_hash: String,
    pub corpus_path: String,
    pub save_time: String,
    pub cache_key: String,
    #[serde(default)]
    pub blob_bytes: u64,
}

/// Result of a cache read.
#[derive(Debug)]
pub enum CacheLookup {
    Hit(FlatIndex),
    Miss,
    /// An entry existed but could not be used; it has been deleted.
    Corrupt,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved { bytes: u64 },
    Refused(String),
    Disabled,
}

enum Inspection {
    Missing,
    Valid,
    Stale(&'static str),
    Corrupt(String),
}

#[derive(Clone)]
pub struct HotCache {
    dir: PathBuf,
    prefix: String,
    ttl: Duration,
    space: SpacePolicy,
    enabled: bool,
    probe: Arc<dyn SpaceProbe>,
}

impl std::fmt::Debug for HotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotCache")
            .field("dir", &self.dir)
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl HotCache {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, ttl: Duration, space: SpacePolicy) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            ttl,
            space,
            enabled: true,
            probe: Arc::new(FsSpaceProbe),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let mut cache = Self::new(
            config.dir.clone(),
            config.prefix.clone(),
            config.ttl(),
            SpacePolicy {
                safe_threshold_percent: config.safe_threshold_percent,
                min_free_bytes: config.min_free_bytes(),
            },
        );
        cache.enabled = config.enabled;
        cache
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        let mut cache = Self::from_config(&CacheConfig::default());
        cache.enabled = false;
        cache
    }

    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Derive the key for a query source from its current on-disk state.
    pub fn key_for(&self, source: &Path) -> Result<CacheKey> {
        let index_dir = artifact::resolve_index_dir(source)
            .ok_or_else(|| IndexError::NotFound(format!("no artifact at {}", source.display())))?;
        let header = artifact::read_header(&index_dir)?;
        let fingerprint = manifest_fingerprint(source)?.unwrap_or_default();
        let manifest_hash = hash_bytes(format!("{fingerprint}:{}", header.build_id).as_bytes());
        let corpus_path = source
            .canonicalize()
            .unwrap_or_else(|_| source.to_path_buf());
        Ok(CacheKey::derive(&corpus_path, &manifest_hash))
    }

    pub fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_path(&key.key, BLOB_EXT)
    }

    pub fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_path(&key.key, META_EXT)
    }

    fn entry_path(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.{}", self.prefix, key, ext))
    }

    fn inspect(&self, key: &CacheKey) -> Inspection {
        let blob_exists = self.blob_path(key).is_file();
        let bytes = match std::fs::read(self.meta_path(key)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return if blob_exists {
                    Inspection::Corrupt("meta file missing".into())
                } else {
                    Inspection::Missing
                };
            }
            Err(err) => return Inspection::Corrupt(err.to_string()),
        };
        let meta: CacheMeta = match serde_json::from_slice(&bytes) {
            Ok(meta) => meta,
            Err(err) => return Inspection::Corrupt(format!("unreadable meta: {err}")),
        };
        if meta.format_version != BLOB_FORMAT_VERSION {
            return Inspection::Stale("format version changed");
        }
        if meta.manifest_hash != key.manifest_hash || meta.cache_key != key.key {
            return Inspection::Stale("manifest hash mismatch");
        }
        if !validator::within_ttl(&meta.save_time, self.ttl, Utc::now()) {
            return Inspection::Stale("expired");
        }
        if !blob_exists {
            return Inspection::Corrupt("blob file missing".into());
        }
        Inspection::Valid
    }

    /// True if a fresh entry exists for `key`. Stale or broken entries are
    /// deleted as a side effect.
    pub fn is_valid(&self, key: &CacheKey) -> bool {
        if !self.enabled {
            return false;
        }
        match self.inspect(key) {
            Inspection::Valid => true,
            Inspection::Missing => false,
            Inspection::Stale(reason) => {
                tracing::debug!(key = %key.key, reason, "hot cache entry invalidated");
                self.invalidate(key);
                false
            }
            Inspection::Corrupt(reason) => {
                tracing::warn!(key = %key.key, reason = %reason, "hot cache entry corrupt");
                self.invalidate(key);
                false
            }
        }
    }

    pub fn load(&self, key: &CacheKey) -> CacheLookup {
        if !self.enabled {
            return CacheLookup::Miss;
        }
        match self.inspect(key) {
            Inspection::Valid => {}
            Inspection::Missing => return CacheLookup::Miss,
            Inspection::Stale(reason) => {
                tracing::debug!(key = %key.key, reason, "hot cache entry invalidated");
                self.invalidate(key);
                return CacheLookup::Miss;
            }
            Inspection::Corrupt(reason) => {
                tracing::warn!(key = %key.key, reason = %reason, "hot cache entry corrupt");
                self.invalidate(key);
                return CacheLookup::Corrupt;
            }
        }

        let bytes = match std::fs::read(self.blob_path(key)) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!(key = %key.key, error = %err, "hot cache blob unreadable");
                self.invalidate(key);
                return CacheLookup::Miss;
            }
        };
        match decode_blob(&bytes) {
            Ok(Some(index)) => {
                tracing::debug!(key = %key.key, bytes = bytes.len(), "hot cache hit");
                CacheLookup::Hit(index)
            }
            Ok(None) => {
                tracing::debug!(key = %key.key, "hot cache blob has an older format");
                self.invalidate(key);
                CacheLookup::Miss
            }
            Err(err) => {
                tracing::warn!(key = %key.key, error = %err, "hot cache blob corrupt");
                self.invalidate(key);
                CacheLookup::Corrupt
            }
        }
    }

    /// Check right now whether `required` bytes may be written.
    pub fn reserve(&self, required: u64) -> Result<()> {
        let usage = self.probe.usage(&self.dir).map_err(|e| {
            IndexError::SpaceExhausted(format!("cannot measure {}: {e}", self.dir.display()))
        })?;
        validator::check_space(usage, &self.space, required)
            .map_err(|refusal| IndexError::SpaceExhausted(refusal.to_string()))
    }

    /// Store `artifact` under `key`, replacing any previous entry for the
    /// same source. Never fails the caller: problems become
    /// [`SaveOutcome::Refused`].
    pub fn save(&self, key: &CacheKey, artifact: &FlatIndex) -> SaveOutcome {
        if !self.enabled {
            return SaveOutcome::Disabled;
        }
        match self.try_save(key, artifact) {
            Ok(bytes) => {
                let purged = self.purge_superseded(key);
                tracing::debug!(key = %key.key, bytes, purged, "hot cache entry saved");
                SaveOutcome::Saved { bytes }
            }
            Err(err) => {
                tracing::info!(key = %key.key, reason = %err, "hot cache save refused");
                SaveOutcome::Refused(err.to_string())
            }
        }
    }

    fn try_save(&self, key: &CacheKey, artifact: &FlatIndex) -> Result<u64> {
        let blob = encode_blob(artifact)?;
        let meta = CacheMeta {
            format_version: BLOB_FORMAT_VERSION,
            manifest_hash: key.manifest_hash.clone(),
            corpus_path: key.corpus_path.display().to_string(),
            save_time: Utc::now().to_rfc3339(),
            cache_key: key.key.clone(),
            blob_bytes: blob.len() as u64,
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;

        std::fs::create_dir_all(&self.dir)?;
        self.reserve((blob.len() + meta_bytes.len()) as u64)?;

        let blob_path = self.blob_path(key);
        atomic_write(&blob_path, &blob)?;
        if let Err(err) = atomic_write(&self.meta_path(key), &meta_bytes) {
            remove_file_best_effort(&blob_path);
            return Err(err.into());
        }
        Ok(blob.len() as u64)
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.remove_entry(&key.key);
    }

    fn remove_entry(&self, key: &str) -> bool {
        let blob = remove_file_best_effort(&self.entry_path(key, BLOB_EXT));
        let meta = remove_file_best_effort(&self.entry_path(key, META_EXT));
        blob && meta
    }
}

fn encode_blob(artifact: &FlatIndex) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    bincode::serialize_into(&mut buf, &BLOB_FORMAT_VERSION)?;
    bincode::serialize_into(&mut buf, artifact)?;
    Ok(buf)
}

/// `Ok(None)` when the blob was written by a different format version.
fn decode_blob(bytes: &[u8]) -> Result<Option<FlatIndex>> {
    let mut cursor = Cursor::new(bytes);
    let version: u32 = bincode::deserialize_from(&mut cursor)?;
    if version != BLOB_FORMAT_VERSION {
        return Ok(None);
    }
    Ok(Some(bincode::deserialize_from(&mut cursor)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::tests::chunks;
    use crate::embedding::HashEmbedder;

    pub(super) struct FixedProbe(pub StoreUsage);

    impl SpaceProbe for FixedProbe {
        fn usage(&self, _dir: &Path) -> std::io::Result<StoreUsage> {
            Ok(self.0)
        }
    }

    const GB: u64 = 1024 * 1024 * 1024;

    pub(super) fn roomy_cache(dir: &Path) -> HotCache {
        HotCache::new(
            dir,
            "test_index",
            Duration::from_secs(3600),
            SpacePolicy {
                safe_threshold_percent: 80,
                min_free_bytes: 1024,
            },
        )
        .with_probe(Arc::new(FixedProbe(StoreUsage {
            total: 10 * GB,
            free: 9 * GB,
        })))
    }

    fn sample_index() -> FlatIndex {
        FlatIndex::build(&chunks("a.txt", &["hot", "cache"]), &HashEmbedder::new(8)).unwrap()
    }

    #[test]
    fn save_then_load_hits() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = roomy_cache(tmp.path());
        let key = CacheKey::derive(Path::new("/corpus/a"), "m1");
        let index = sample_index();

        assert!(matches!(cache.load(&key), CacheLookup::Miss));
        assert!(matches!(cache.save(&key, &index), SaveOutcome::Saved { .. }));
        assert!(cache.is_valid(&key));
        match cache.load(&key) {
            CacheLookup::Hit(loaded) => assert_eq!(loaded, index),
            other => panic!("expected hit, got {other:?}"),
        }
        assert_eq!(key.key.len(), 16);
        assert!(cache.blob_path(&key).is_file());
        assert!(cache.meta_path(&key).is_file());
    }

    #[test]
    fn manifest_mismatch_invalidates_and_deletes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = roomy_cache(tmp.path());
        let key = CacheKey::derive(Path::new("/corpus/a"), "m1");
        cache.save(&key, &sample_index());

        // Same file names, different manifest hash recorded by the caller.
        let tampered = CacheKey {
            manifest_hash: "m2".into(),
            ..key.clone()
        };
        assert!(!cache.is_valid(&tampered));
        assert!(!cache.blob_path(&key).exists());
        assert!(!cache.meta_path(&key).exists());
    }

    #[test]
    fn full_store_refuses_save() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = roomy_cache(tmp.path()).with_probe(Arc::new(FixedProbe(StoreUsage {
            total: 10 * GB,
            free: GB,
        })));
        let key = CacheKey::derive(Path::new("/corpus/a"), "m1");
        assert!(matches!(
            cache.save(&key, &sample_index()),
            SaveOutcome::Refused(_)
        ));
        assert!(!cache.blob_path(&key).exists());
        assert!(matches!(
            cache.reserve(1),
            Err(IndexError::SpaceExhausted(_))
        ));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = roomy_cache(tmp.path());
        let key = CacheKey::derive(Path::new("/corpus/a"), "m1");
        cache.save(&key, &sample_index());

        let mut meta: CacheMeta =
            serde_json::from_slice(&std::fs::read(cache.meta_path(&key)).unwrap()).unwrap();
        meta.save_time = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        std::fs::write(cache.meta_path(&key), serde_json::to_vec(&meta).unwrap()).unwrap();

        assert!(matches!(cache.load(&key), CacheLookup::Miss));
        assert!(!cache.blob_path(&key).exists());
    }

    #[test]
    fn corrupt_blob_reports_corrupt() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = roomy_cache(tmp.path());
        let key = CacheKey::derive(Path::new("/corpus/a"), "m1");
        cache.save(&key, &sample_index());
        std::fs::write(cache.blob_path(&key), [1u8, 0, 0, 0, 9, 9]).unwrap();
        assert!(matches!(cache.load(&key), CacheLookup::Corrupt));
        assert!(!cache.meta_path(&key).exists());
    }

    #[test]
    fn old_blob_format_is_a_miss() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = roomy_cache(tmp.path());
        let key = CacheKey::derive(Path::new("/corpus/a"), "m1");
        cache.save(&key, &sample_index());
        let mut bytes = std::fs::read(cache.blob_path(&key)).unwrap();
        bytes[0] = 99;
        std::fs::write(cache.blob_path(&key), bytes).unwrap();
        assert!(matches!(cache.load(&key), CacheLookup::Miss));
    }

    #[test]
    fn disabled_cache_never_stores() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = CacheConfig::default();
        config.dir = tmp.path().to_path_buf();
        config.enabled = false;
        let cache = HotCache::from_config(&config);
        let key = CacheKey::derive(Path::new("/corpus/a"), "m1");
        assert_eq!(cache.save(&key, &sample_index()), SaveOutcome::Disabled);
        assert!(matches!(cache.load(&key), CacheLookup::Miss));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn key_tracks_artifact_rebuilds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("src");
        let index = sample_index();
        index.save(&source).unwrap();
        let cache = roomy_cache(&tmp.path().join("shm"));

        let first = cache.key_for(&source).unwrap();
        assert_eq!(cache.key_for(&source).unwrap(), first);
        index.save(&source).unwrap();
        assert_ne!(cache.key_for(&source).unwrap(), first);
    }
}
