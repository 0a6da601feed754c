//! Error taxonomy for the index cache.
//!
//! Every failure the library can surface is an [`IndexError`]. Callers that
//! need to decide between "fall back and rebuild" and "give up" should branch
//! on [`IndexError::kind`] rather than on individual variants.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors produced while hashing, caching, merging, or querying artifacts.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// A corpus, artifact, or manifest is missing. Recoverable by rebuilding.
    #[error("not found: {0}")]
    NotFound(String),

    /// Artifact or cache files exist but cannot be read back consistently.
    #[error("corrupt data at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// The ephemeral cache store refused a write.
    #[error("ephemeral store has no room: {0}")]
    SpaceExhausted(String),

    /// Some sources of a batch or query failed while others succeeded.
    #[error("{failed} of {total} sources failed")]
    PartialFailure { failed: usize, total: usize },

    /// Swapping a merged artifact into place failed.
    #[error("atomic replace of {target} failed (rolled back: {rolled_back}): {reason}")]
    AtomicReplace {
        target: PathBuf,
        reason: String,
        rolled_back: bool,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Another merge holds the corpus lock.
    #[error("corpus {0} is locked by another merge")]
    Busy(PathBuf),

    #[error("refusing to delete {count} cache folders without confirmation")]
    ConfirmationRequired { count: usize },

    #[error("cannot extract text from {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("glob error: {0}")]
    Glob(#[from] globset::Error),
}

/// Coarse classification used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Nothing usable exists yet; build it.
    Miss,
    /// Something exists but is unusable; discard it and build again.
    Corrupt,
    /// Stop and report.
    Fatal,
}

impl IndexError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::NotFound(_) | IndexError::SpaceExhausted(_) => ErrorKind::Miss,
            IndexError::Io(err) if err.kind() == std::io::ErrorKind::NotFound => ErrorKind::Miss,
            IndexError::Corrupt { .. } | IndexError::Json(_) | IndexError::Bincode(_) => {
                ErrorKind::Corrupt
            }
            _ => ErrorKind::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_a_miss() {
        let err = IndexError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ErrorKind::Miss);
        assert_eq!(IndexError::NotFound("x".into()).kind(), ErrorKind::Miss);
    }

    #[test]
    fn decode_failures_are_corrupt() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        assert_eq!(IndexError::from(json_err).kind(), ErrorKind::Corrupt);
        assert_eq!(
            IndexError::corrupt("/tmp/a", "bad header").kind(),
            ErrorKind::Corrupt
        );
    }

    #[test]
    fn replace_failures_are_fatal() {
        let err = IndexError::AtomicReplace {
            target: PathBuf::from("/tmp/t"),
            reason: "rename failed".into(),
            rolled_back: true,
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("rolled back: true"));
    }
}
