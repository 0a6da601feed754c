//! Streaming content hashing.
//!
//! Identifiers are SHA-256 digests truncated to 128 bits and rendered as 32
//! lowercase hex characters. The same identifier names a document's cache
//! folder, so [`is_content_hash`] doubles as the folder-name check.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Bytes kept from the SHA-256 output.
pub const DIGEST_BYTES: usize = 16;

/// Default read size for streaming file hashes (1 MiB).
pub const DEFAULT_HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Hashes files and readers in fixed-size chunks so large PDFs never need to
/// be held in memory.
#[derive(Debug, Clone, Copy)]
pub struct ContentHasher {
    chunk_size: usize,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_CHUNK_SIZE)
    }
}

impl ContentHasher {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn hash_file(&self, path: &Path) -> io::Result<String> {
        self.hash_files(&[path])
    }

    /// Hash several files as one stream, in the order given.
    pub fn hash_files(&self, paths: &[&Path]) -> io::Result<String> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        for path in paths {
            let mut file = File::open(path)?;
            feed(&mut hasher, &mut file, &mut buf)?;
        }
        Ok(finish(hasher))
    }

    pub fn hash_reader<R: Read>(&self, mut reader: R) -> io::Result<String> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        feed(&mut hasher, &mut reader, &mut buf)?;
        Ok(finish(hasher))
    }
}

fn feed<R: Read>(hasher: &mut Sha256, reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    loop {
        let n = match reader.read(buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..n]);
    }
}

fn finish(hasher: Sha256) -> String {
    hex::encode(&hasher.finalize()[..DIGEST_BYTES])
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    finish(hasher)
}

/// Fingerprint of a set of content hashes.
///
/// Input order and duplicates do not matter: the hashes are deduplicated,
/// sorted, concatenated, and hashed again.
pub fn concatenated_hash<I, S>(hashes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    hash_bytes(concatenate_sorted(hashes).as_bytes())
}

/// The sorted, deduplicated concatenation that [`concatenated_hash`] digests.
pub fn concatenate_sorted<I, S>(hashes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: std::collections::BTreeSet<String> = hashes
        .into_iter()
        .map(|h| h.as_ref().to_string())
        .collect();
    set.into_iter().collect::<Vec<_>>().concat()
}

pub fn is_content_hash(name: &str) -> bool {
    name.len() == DIGEST_BYTES * 2 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
