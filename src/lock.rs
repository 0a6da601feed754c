//! Single-writer lock per corpus directory.
//!
//! Syncs mutate the manifest and the aggregate artifact, so at most one may
//! run per corpus. The lock is a `fs2` advisory lock on `<corpus>/.cidx.lock`
//! for cross-process exclusion, paired with an in-process mutex because
//! `fs2` locks do not exclude other threads of the same process.

use fs2::FileExt as _;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, TryLockError};

use crate::error::{IndexError, Result};

pub const LOCK_FILE: &str = ".cidx.lock";

/// Held for the duration of a sync. Released on drop.
#[derive(Debug)]
pub struct CorpusLock {
    file: File,
    path: PathBuf,
    _guard: MutexGuard<'static, ()>,
}

impl CorpusLock {
    /// Block until the lock for `corpus_dir` is available.
    pub fn acquire(corpus_dir: &Path) -> Result<Self> {
        let path = lock_path(corpus_dir)?;
        let guard = process_lock_for_path(&path)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let file = open_lock_file(&path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path,
            _guard: guard,
        })
    }

    /// Take the lock without waiting; [`IndexError::Busy`] if another sync
    /// holds it.
    pub fn try_acquire(corpus_dir: &Path) -> Result<Self> {
        let path = lock_path(corpus_dir)?;
        let guard = match process_lock_for_path(&path).try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(IndexError::Busy(corpus_dir.to_path_buf())),
        };
        let file = open_lock_file(&path)?;
        if let Err(err) = file.try_lock_exclusive() {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(IndexError::Busy(corpus_dir.to_path_buf()));
            }
            return Err(err.into());
        }
        Ok(Self {
            file,
            path,
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CorpusLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_path(corpus_dir: &Path) -> Result<PathBuf> {
    if !corpus_dir.is_dir() {
        return Err(IndexError::NotFound(format!(
            "corpus directory {}",
            corpus_dir.display()
        )));
    }
    let dir = corpus_dir.canonicalize()?;
    Ok(dir.join(LOCK_FILE))
}

fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?)
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = map.get(path) {
        return existing;
    }

    let mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
    map.insert(path.to_path_buf(), mutex);
    mutex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_writer_is_busy() {
        let tmp = tempfile::TempDir::new().unwrap();
        let held = CorpusLock::try_acquire(tmp.path()).unwrap();
        assert!(held.path().ends_with(LOCK_FILE));
        assert!(matches!(
            CorpusLock::try_acquire(tmp.path()),
            Err(IndexError::Busy(_))
        ));
        drop(held);
        assert!(CorpusLock::try_acquire(tmp.path()).is_ok());
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();
        let held = CorpusLock::acquire(&dir).unwrap();

        let waiter = {
            let dir = dir.clone();
            std::thread::spawn(move || CorpusLock::acquire(&dir).map(|_| ()))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn missing_corpus_is_not_created() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("typo");
        assert!(matches!(
            CorpusLock::acquire(&missing),
            Err(IndexError::NotFound(_))
        ));
        assert!(matches!(
            CorpusLock::try_acquire(&missing),
            Err(IndexError::NotFound(_))
        ));
        assert!(!missing.exists());
    }

    #[test]
    fn different_corpora_do_not_contend() {
        let a = tempfile::TempDir::new().unwrap();
        let b = tempfile::TempDir::new().unwrap();
        let _la = CorpusLock::try_acquire(a.path()).unwrap();
        assert!(CorpusLock::try_acquire(b.path()).is_ok());
    }
}
