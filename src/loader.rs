//! Document loading and splitting.
//!
//! [`DocumentLoader`] turns a file on disk into [`TextChunk`]s ready for
//! embedding. [`FileLoader`] handles plain text, Markdown, and PDF.

use std::path::Path;

use crate::chunk::split_text;
use crate::config::ChunkingConfig;
use crate::error::{IndexError, Result};
use crate::models::TextChunk;

pub trait DocumentLoader: Send + Sync {
    fn load_and_split(&self, path: &Path) -> Result<Vec<TextChunk>>;
}

/// Loads `.txt`, `.md`, and `.pdf` files.
///
/// PDF pages are separated by form feeds in the extracted text; each chunk
/// records the zero-based page it came from.
pub struct FileLoader {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl FileLoader {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        }
    }

    fn extract_pages(&self, path: &Path) -> Result<Vec<String>> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "pdf" => {
                let text = pdf_extract::extract_text(path).map_err(|e| IndexError::Extraction {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
                Ok(text.split('\x0c').map(str::to_string).collect())
            }
            "txt" | "md" | "markdown" => {
                let bytes = std::fs::read(path)?;
                Ok(vec![String::from_utf8_lossy(&bytes).into_owned()])
            }
            other => Err(IndexError::Extraction {
                path: path.to_path_buf(),
                reason: format!("unsupported file type {other:?}"),
            }),
        }
    }
}

impl DocumentLoader for FileLoader {
    fn load_and_split(&self, path: &Path) -> Result<Vec<TextChunk>> {
        let pages = self.extract_pages(path)?;
        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let paged = pages.len() > 1
            || path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));

        let mut chunks = Vec::new();
        for (page_no, page) in pages.iter().enumerate() {
            for text in split_text(page, self.chunk_size, self.chunk_overlap) {
                chunks.push(TextChunk {
                    text,
                    source_file: source_file.clone(),
                    page: paged.then_some(page_no as u32),
                });
            }
        }

        if chunks.is_empty() {
            return Err(IndexError::InvalidInput(format!(
                "no text chunks extracted from {}",
                path.display()
            )));
        }
        tracing::debug!(path = %path.display(), chunks = chunks.len(), "document split");
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> FileLoader {
        FileLoader::new(&ChunkingConfig {
            chunk_size: 80,
            chunk_overlap: 10,
        })
    }

    #[test]
    fn test_text_file_chunks_carry_source() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("notes.md");
        std::fs::write(&path, "# Title\n\nSome body text.\n\nAnother paragraph here.").unwrap();
        let chunks = loader().load_and_split(&path).unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.source_file == "notes.md"));
        assert!(chunks.iter().all(|c| c.page.is_none()));
    }

    #[test]
    fn test_blank_document_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("blank.txt");
        std::fs::write(&path, "   \n\n  ").unwrap();
        let err = loader().load_and_split(&path).unwrap_err();
        assert!(matches!(err, IndexError::InvalidInput(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("image.png");
        std::fs::write(&path, [0u8, 1, 2]).unwrap();
        assert!(matches!(
            loader().load_and_split(&path),
            Err(IndexError::Extraction { .. })
        ));
    }
}
