//! Flat vector-index artifacts.
//!
//! An artifact directory holds exactly two files:
//!
//! | File | Format | Contents |
//! |------|--------|----------|
//! | `index.vec` | bincode | [`VectorHeader`] followed by the vectors |
//! | `index.json` | JSON | docstore: model, dims, and one record per chunk |
//!
//! Both files carry the same `build_id`. A directory is valid only when both
//! files exist, decode, share a build id, and agree on the chunk count; any
//! other state is treated as missing or corrupt, never as a usable index.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{IndexError, Result};
use crate::hashing::{hash_bytes, ContentHasher};
use crate::models::{RetrievedChunk, TextChunk};

pub const VECTOR_FILE: &str = "index.vec";
pub const DOCSTORE_FILE: &str = "index.json";
pub const ARTIFACT_FILES: [&str; 2] = [VECTOR_FILE, DOCSTORE_FILE];
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Name of the aggregate subfolder in the traditional corpus layout.
pub const NESTED_INDEX_DIR: &str = crate::config::AGGREGATE_DIR_NAME;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorHeader {
    pub format_version: u32,
    pub build_id: String,
    pub dims: u32,
    pub count: u64,
}

/// One chunk record in the docstore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub text: String,
    pub source_file: String,
    #[serde(default)]
    pub page: Option<u32>,
    pub chunk_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DocStore {
    format_version: u32,
    build_id: String,
    model: String,
    dims: usize,
    chunks: Vec<StoredChunk>,
}

/// An in-memory, brute-force cosine index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatIndex {
    model: String,
    dims: usize,
    vectors: Vec<Vec<f32>>,
    chunks: Vec<StoredChunk>,
}

impl FlatIndex {
    pub fn empty(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
            vectors: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Embed `chunks` and build an index over them.
    pub fn build(chunks: &[TextChunk], embedder: &dyn Embedder) -> Result<Self> {
        if chunks.is_empty() {
            return Err(IndexError::InvalidInput(
                "cannot build an index from zero chunks".into(),
            ));
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed(&texts)?;
        if vectors.len() != chunks.len() {
            return Err(IndexError::Embedding(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        let dims = embedder.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(IndexError::Embedding(format!(
                "embedder returned a {}-dim vector, expected {}",
                bad.len(),
                dims
            )));
        }

        let stored = chunks
            .iter()
            .map(|c| StoredChunk {
                text: c.text.clone(),
                source_file: c.source_file.clone(),
                page: c.page,
                chunk_hash: hash_bytes(c.text.as_bytes()),
            })
            .collect();

        Ok(Self {
            model: embedder.model_name().to_string(),
            dims,
            vectors,
            chunks: stored,
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn chunks(&self) -> &[StoredChunk] {
        &self.chunks
    }

    /// Append every vector of `other` to this index.
    pub fn merge_from(&mut self, other: FlatIndex) -> Result<()> {
        if other.is_empty() {
            return Ok(());
        }
        if self.is_empty() && self.vectors.is_empty() {
            self.dims = other.dims;
            if self.model.is_empty() {
                self.model = other.model.clone();
            }
        }
        if other.dims != self.dims {
            return Err(IndexError::Merge(format!(
                "dimension mismatch: {} vs {}",
                self.dims, other.dims
            )));
        }
        if other.model != self.model {
            tracing::warn!(
                ours = %self.model,
                theirs = %other.model,
                "merging indexes built with different embedding models"
            );
        }
        self.vectors.extend(other.vectors);
        self.chunks.extend(other.chunks);
        Ok(())
    }

    /// Top `k` chunks by cosine similarity. Ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<RetrievedChunk> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| {
                let chunk = &self.chunks[i];
                RetrievedChunk {
                    text: chunk.text.clone(),
                    source_file: chunk.source_file.clone(),
                    page: chunk.page,
                    score,
                }
            })
            .collect()
    }

    /// Write both artifact files into `dir`, returning the new build id.
    pub fn save(&self, dir: &Path) -> Result<String> {
        std::fs::create_dir_all(dir)?;
        let build_id = uuid::Uuid::new_v4().to_string();

        let header = VectorHeader {
            format_version: ARTIFACT_FORMAT_VERSION,
            build_id: build_id.clone(),
            dims: self.dims as u32,
            count: self.vectors.len() as u64,
        };
        let file = File::create(dir.join(VECTOR_FILE))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &header)?;
        bincode::serialize_into(&mut writer, &self.vectors)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        let store = DocStore {
            format_version: ARTIFACT_FORMAT_VERSION,
            build_id: build_id.clone(),
            model: self.model.clone(),
            dims: self.dims,
            chunks: self.chunks.clone(),
        };
        let file = File::create(dir.join(DOCSTORE_FILE))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &store)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        Ok(build_id)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let (header, vectors) = read_vectors(dir)?;
        let store = read_docstore(dir)?;
        check_consistency(dir, &header, &store)?;
        if vectors.len() as u64 != header.count
            || vectors.iter().any(|v| v.len() != header.dims as usize)
        {
            return Err(IndexError::corrupt(
                dir.join(VECTOR_FILE),
                "vector payload does not match header",
            ));
        }
        Ok(Self {
            model: store.model,
            dims: store.dims,
            vectors,
            chunks: store.chunks,
        })
    }
}

fn open_artifact_file(dir: &Path, name: &str) -> Result<File> {
    let path = dir.join(name);
    File::open(&path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            IndexError::NotFound(path.display().to_string())
        } else {
            IndexError::Io(err)
        }
    })
}

fn decode_header<R: std::io::Read>(reader: &mut R, path: &Path) -> Result<VectorHeader> {
    let header: VectorHeader = bincode::deserialize_from(reader)
        .map_err(|e| IndexError::corrupt(path, format!("unreadable header: {e}")))?;
    if header.format_version != ARTIFACT_FORMAT_VERSION {
        return Err(IndexError::corrupt(
            path,
            format!("unsupported format version {}", header.format_version),
        ));
    }
    Ok(header)
}

/// Read only the fixed header of `index.vec`.
pub fn read_header(dir: &Path) -> Result<VectorHeader> {
    let mut reader = BufReader::new(open_artifact_file(dir, VECTOR_FILE)?);
    decode_header(&mut reader, &dir.join(VECTOR_FILE))
}

fn read_vectors(dir: &Path) -> Result<(VectorHeader, Vec<Vec<f32>>)> {
    let path = dir.join(VECTOR_FILE);
    let mut reader = BufReader::new(open_artifact_file(dir, VECTOR_FILE)?);
    let header = decode_header(&mut reader, &path)?;
    let vectors: Vec<Vec<f32>> = bincode::deserialize_from(&mut reader)
        .map_err(|e| IndexError::corrupt(&path, format!("unreadable vectors: {e}")))?;
    Ok((header, vectors))
}

fn read_docstore(dir: &Path) -> Result<DocStore> {
    let path = dir.join(DOCSTORE_FILE);
    let reader = BufReader::new(open_artifact_file(dir, DOCSTORE_FILE)?);
    serde_json::from_reader(reader)
        .map_err(|e| IndexError::corrupt(&path, format!("unreadable docstore: {e}")))
}

fn check_consistency(dir: &Path, header: &VectorHeader, store: &DocStore) -> Result<()> {
    if store.format_version != ARTIFACT_FORMAT_VERSION {
        return Err(IndexError::corrupt(
            dir.join(DOCSTORE_FILE),
            format!("unsupported format version {}", store.format_version),
        ));
    }
    if header.build_id != store.build_id {
        return Err(IndexError::corrupt(
            dir,
            format!(
                "build id mismatch: {} vs {}",
                header.build_id, store.build_id
            ),
        ));
    }
    if header.count != store.chunks.len() as u64 || header.dims as usize != store.dims {
        return Err(IndexError::corrupt(
            dir,
            "vector file and docstore disagree on shape",
        ));
    }
    Ok(())
}

/// Check that `dir` holds a complete, self-consistent artifact without
/// decoding the vectors.
pub fn validate_dir(dir: &Path) -> Result<VectorHeader> {
    let header = read_header(dir)?;
    let store = read_docstore(dir)?;
    check_consistency(dir, &header, &store)?;
    Ok(header)
}

pub fn is_valid_dir(dir: &Path) -> bool {
    validate_dir(dir).is_ok()
}

/// Combined hash of both artifact files, or `None` if either is missing.
pub fn index_hash(dir: &Path, hasher: &ContentHasher) -> Result<Option<String>> {
    let vec_path = dir.join(VECTOR_FILE);
    let doc_path = dir.join(DOCSTORE_FILE);
    if !vec_path.is_file() || !doc_path.is_file() {
        return Ok(None);
    }
    Ok(Some(hasher.hash_files(&[&vec_path, &doc_path])?))
}

/// Locate the artifact files for a query source.
///
/// A source is either an artifact directory itself or a corpus directory with
/// a nested aggregate subfolder.
pub fn resolve_index_dir(source: &Path) -> Option<PathBuf> {
    if source.join(VECTOR_FILE).is_file() {
        return Some(source.to_path_buf());
    }
    let nested = source.join(NESTED_INDEX_DIR);
    if nested.join(VECTOR_FILE).is_file() {
        return Some(nested);
    }
    None
}
