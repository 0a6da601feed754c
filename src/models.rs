//! Core data models shared across the cache, merge, and query layers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A source document found by a corpus scan.
///
/// Documents are immutable once hashed: editing a file produces a new
/// `content_hash` and therefore a new logical document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Path relative to the corpus root, used as the display name.
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Modification time in fractional seconds since the Unix epoch.
    pub mtime: f64,
    pub content_hash: String,
}

/// One piece of extracted document text, before embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
    pub source_file: String,
    #[serde(default)]
    pub page: Option<u32>,
}

/// A chunk returned from an artifact search, with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub source_file: String,
    pub page: Option<u32>,
    pub score: f32,
}

/// Location of a per-document artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArtifactRef {
    pub content_hash: String,
    pub dir: PathBuf,
}
