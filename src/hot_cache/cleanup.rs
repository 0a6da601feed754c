//! Maintenance operations over the ephemeral store.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use super::validator::{within_ttl, StoreUsage};
use super::{CacheKey, CacheMeta, HotCache, BLOB_EXT, META_EXT};
use crate::error::Result;

#[derive(Debug, Clone, Default)]
struct EntryFiles {
    blob: Option<PathBuf>,
    meta: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub blob_bytes: u64,
    pub usage: Option<StoreUsage>,
}

impl HotCache {
    /// Files in the cache directory that belong to this cache's prefix,
    /// grouped by key.
    fn entries(&self) -> Result<BTreeMap<String, EntryFiles>> {
        let mut entries: BTreeMap<String, EntryFiles> = BTreeMap::new();
        if !self.dir.is_dir() {
            return Ok(entries);
        }
        let prefix = format!("{}_", self.prefix);
        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some((key, ext)) = rest.rsplit_once('.') else {
                continue;
            };
            let slot = entries.entry(key.to_string()).or_default();
            match ext {
                BLOB_EXT => slot.blob = Some(dirent.path()),
                META_EXT => slot.meta = Some(dirent.path()),
                _ => {}
            }
        }
        Ok(entries)
    }

    fn read_meta(files: &EntryFiles) -> Option<CacheMeta> {
        let bytes = std::fs::read(files.meta.as_ref()?).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn expired_by_mtime(&self, files: &EntryFiles) -> bool {
        let newest = [&files.blob, &files.meta]
            .into_iter()
            .flatten()
            .filter_map(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
            .max();
        match newest {
            Some(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age > self.ttl)
                .unwrap_or(false),
            None => true,
        }
    }

    /// Remove entries older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for (key, files) in self.entries()? {
            let expired = match Self::read_meta(&files) {
                Some(meta) => !within_ttl(&meta.save_time, self.ttl, now),
                None => self.expired_by_mtime(&files),
            };
            if expired && self.remove_entry(&key) {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "expired hot cache entries swept");
        }
        Ok(removed)
    }

    /// Remove every entry with this cache's prefix.
    pub fn clear_all(&self) -> Result<usize> {
        let mut removed = 0;
        for key in self.entries()?.keys() {
            if self.remove_entry(key) {
                removed += 1;
            }
        }
        tracing::info!(removed, dir = %self.dir.display(), "hot cache cleared");
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let entries = self.entries()?;
        let blob_bytes = entries
            .values()
            .filter_map(|f| f.blob.as_ref())
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        let usage = if self.dir.is_dir() {
            self.probe.usage(&self.dir).ok()
        } else {
            None
        };
        Ok(CacheStats {
            entries: entries.len(),
            blob_bytes,
            usage,
        })
    }

    /// Drop other entries saved for the same source under an older key.
    pub(super) fn purge_superseded(&self, key: &CacheKey) -> usize {
        let Ok(entries) = self.entries() else {
            return 0;
        };
        let corpus_path = key.corpus_path.display().to_string();
        let mut purged = 0;
        for (other, files) in entries {
            if other == key.key {
                continue;
            }
            if Self::read_meta(&files).is_some_and(|m| m.corpus_path == corpus_path)
                && self.remove_entry(&other)
            {
                purged += 1;
            }
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::roomy_cache;
    use super::*;
    use crate::artifact::tests::chunks;
    use crate::artifact::FlatIndex;
    use crate::embedding::HashEmbedder;
    use std::path::Path;

    fn index() -> FlatIndex {
        FlatIndex::build(&chunks("a", &["x"]), &HashEmbedder::new(4)).unwrap()
    }

    #[test]
    fn save_replaces_older_entry_for_same_source() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = roomy_cache(tmp.path());
        let old = CacheKey::derive(Path::new("/corpus/a"), "m1");
        let other = CacheKey::derive(Path::new("/corpus/b"), "m1");
        let new = CacheKey::derive(Path::new("/corpus/a"), "m2");
        cache.save(&old, &index());
        cache.save(&other, &index());
        cache.save(&new, &index());

        assert!(!cache.blob_path(&old).exists());
        assert!(cache.blob_path(&other).exists());
        assert!(cache.blob_path(&new).exists());
        assert_eq!(cache.stats().unwrap().entries, 2);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = roomy_cache(tmp.path());
        let fresh = CacheKey::derive(Path::new("/corpus/a"), "m1");
        let stale = CacheKey::derive(Path::new("/corpus/b"), "m1");
        cache.save(&fresh, &index());
        cache.save(&stale, &index());

        let mut meta: CacheMeta =
            serde_json::from_slice(&std::fs::read(cache.meta_path(&stale)).unwrap()).unwrap();
        meta.save_time = (Utc::now() - chrono::Duration::days(3)).to_rfc3339();
        std::fs::write(cache.meta_path(&stale), serde_json::to_vec(&meta).unwrap()).unwrap();

        assert_eq!(cache.sweep_expired().unwrap(), 1);
        assert!(cache.blob_path(&fresh).exists());
        assert!(!cache.blob_path(&stale).exists());
    }

    #[test]
    fn clear_all_leaves_foreign_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = roomy_cache(tmp.path());
        cache.save(&CacheKey::derive(Path::new("/a"), "m"), &index());
        cache.save(&CacheKey::derive(Path::new("/b"), "m"), &index());
        std::fs::write(tmp.path().join("unrelated.txt"), "keep").unwrap();

        assert_eq!(cache.clear_all().unwrap(), 2);
        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.blob_bytes, 0);
        assert!(stats.usage.is_some());
        assert!(tmp.path().join("unrelated.txt").exists());
    }
}
