//! Crash-safe swap of a merged artifact into its target directory.
//!
//! `replace(temp, target)`:
//!
//! 1. refuse unless `temp` holds a complete, consistent artifact;
//! 2. move every file of `target` into `<target>.backups/<timestamp>/` and
//!    remove the emptied `target`;
//! 3. rename `temp` to `target` in one metadata operation;
//! 4. if step 2 or 3 fails, move the backed-up files back and surface the
//!    error.
//!
//! Files are moved, never copied, so after a crash each file lives in exactly
//! one of the two places. Backup sets are never deleted here.

use chrono::Local;
use std::io;
use std::path::{Path, PathBuf};

use crate::artifact;
use crate::error::{IndexError, Result};
use crate::fsutil::unique_sibling;

/// The filesystem operations a replace performs. Swappable so tests can
/// inject a failure at any step.
pub trait FsOps: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

impl FsOps for StdFs {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceReport {
    pub target: PathBuf,
    /// Where the previous contents went, if there were any and backup was on.
    pub backup_dir: Option<PathBuf>,
    pub moved: usize,
}

/// `<target>.backups`, next to the target.
pub fn backup_root(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());
    target.with_file_name(format!("{name}.backups"))
}

/// Backup sets under `<target>.backups`, oldest first.
pub fn list_backups(target: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(backup_root(target)) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

#[derive(Debug, Default)]
pub struct AtomicMergeWriter<F: FsOps = StdFs> {
    fs: F,
}

impl AtomicMergeWriter<StdFs> {
    pub fn new() -> Self {
        Self { fs: StdFs }
    }
}

impl<F: FsOps> AtomicMergeWriter<F> {
    pub fn with_fs(fs: F) -> Self {
        Self { fs }
    }

    /// A fresh, empty build directory on the same filesystem as `target`.
    pub fn create_temp_dir(&self, target: &Path) -> Result<PathBuf> {
        let temp = unique_sibling(target, "merge");
        self.fs.create_dir_all(&temp)?;
        tracing::debug!(temp = %temp.display(), "created merge temp dir");
        Ok(temp)
    }

    pub fn cleanup_temp_dir(&self, temp: &Path) {
        if temp.exists() {
            if let Err(err) = self.fs.remove_dir_all(temp) {
                tracing::warn!(temp = %temp.display(), error = %err, "failed to remove merge temp dir");
            }
        }
    }

    pub fn replace(&self, temp: &Path, target: &Path, backup: bool) -> Result<ReplaceReport> {
        if let Err(err) = artifact::validate_dir(temp) {
            return Err(IndexError::AtomicReplace {
                target: target.to_path_buf(),
                reason: format!("new artifact is incomplete: {err}"),
                rolled_back: false,
            });
        }

        if !target.exists() {
            self.swap_in(temp, target).map_err(|err| IndexError::AtomicReplace {
                target: target.to_path_buf(),
                reason: format!("rename failed: {err}"),
                rolled_back: false,
            })?;
            tracing::info!(target = %target.display(), "artifact installed");
            return Ok(ReplaceReport {
                target: target.to_path_buf(),
                backup_dir: None,
                moved: 0,
            });
        }

        if backup {
            self.replace_with_backup(temp, target)
        } else {
            self.replace_discarding(temp, target)
        }
    }

    fn swap_in(&self, temp: &Path, target: &Path) -> io::Result<()> {
        self.fs.rename(temp, target)
    }

    fn replace_with_backup(&self, temp: &Path, target: &Path) -> Result<ReplaceReport> {
        let backup_dir = self
            .create_backup_dir(target)
            .map_err(|err| IndexError::AtomicReplace {
                target: target.to_path_buf(),
                reason: format!("cannot create backup set: {err}"),
                rolled_back: false,
            })?;
        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();

        let staged = (|| -> io::Result<()> {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(target)?
                .map(|e| e.map(|e| e.path()))
                .collect::<io::Result<_>>()?;
            entries.sort();
            for from in entries {
                let Some(name) = from.file_name() else {
                    continue;
                };
                let to = backup_dir.join(name);
                self.fs.rename(&from, &to)?;
                moved.push((from, to));
            }
            self.fs.remove_dir(target)?;
            self.swap_in(temp, target)
        })();

        match staged {
            Ok(()) => {
                tracing::info!(
                    target = %target.display(),
                    backup = %backup_dir.display(),
                    moved = moved.len(),
                    "artifact replaced"
                );
                Ok(ReplaceReport {
                    target: target.to_path_buf(),
                    backup_dir: Some(backup_dir),
                    moved: moved.len(),
                })
            }
            Err(err) => {
                let rolled_back = self.rollback(target, &backup_dir, &moved);
                tracing::error!(
                    target = %target.display(),
                    error = %err,
                    rolled_back,
                    "atomic replace failed"
                );
                Err(IndexError::AtomicReplace {
                    target: target.to_path_buf(),
                    reason: err.to_string(),
                    rolled_back,
                })
            }
        }
    }

    /// Move displaced files back into `target`. True if the target holds its
    /// previous contents again.
    fn rollback(&self, target: &Path, backup_dir: &Path, moved: &[(PathBuf, PathBuf)]) -> bool {
        if let Err(err) = self.fs.create_dir_all(target) {
            tracing::error!(target = %target.display(), error = %err, "rollback cannot recreate target");
            return false;
        }
        let mut restored = true;
        for (original, backed_up) in moved.iter().rev() {
            if let Err(err) = self.fs.rename(backed_up, original) {
                tracing::error!(
                    file = %backed_up.display(),
                    error = %err,
                    "rollback left file in backup"
                );
                restored = false;
            }
        }
        if restored {
            let _ = self.fs.remove_dir(backup_dir);
        }
        restored
    }

    fn replace_discarding(&self, temp: &Path, target: &Path) -> Result<ReplaceReport> {
        let trash = unique_sibling(target, "trash");
        self.fs.rename(target, &trash).map_err(|err| IndexError::AtomicReplace {
            target: target.to_path_buf(),
            reason: format!("cannot move old artifact aside: {err}"),
            rolled_back: false,
        })?;
        if let Err(err) = self.swap_in(temp, target) {
            let rolled_back = self.fs.rename(&trash, target).is_ok();
            return Err(IndexError::AtomicReplace {
                target: target.to_path_buf(),
                reason: err.to_string(),
                rolled_back,
            });
        }
        if let Err(err) = self.fs.remove_dir_all(&trash) {
            tracing::warn!(trash = %trash.display(), error = %err, "old artifact left behind");
        }
        tracing::info!(target = %target.display(), "artifact replaced without backup");
        Ok(ReplaceReport {
            target: target.to_path_buf(),
            backup_dir: None,
            moved: 0,
        })
    }

    /// `<target>.backups/<YYYYmmdd-HHMMSS>[-N]`, never reusing an existing set.
    fn create_backup_dir(&self, target: &Path) -> Result<PathBuf> {
        let root = backup_root(target);
        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let mut candidate = root.join(&stamp);
        let mut n = 1;
        while candidate.exists() {
            candidate = root.join(format!("{stamp}-{n}"));
            n += 1;
        }
        self.fs.create_dir_all(&candidate)?;
        Ok(candidate)
    }
}
