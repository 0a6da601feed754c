use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::IndexError;

/// Default location of the aggregate artifact inside a corpus directory.
pub const AGGREGATE_DIR_NAME: &str = ".mini_rag_index";

/// One year.
pub const MAX_TTL_HOURS: u64 = 24 * 365;
const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default = "default_corpus_dir")]
    pub dir: PathBuf,
    /// Directory name of the aggregate artifact, relative to the corpus.
    #[serde(default = "default_aggregate_dir_name")]
    pub aggregate_dir_name: String,
    /// Where per-document hash folders live. Defaults to the corpus itself.
    #[serde(default)]
    pub cache_root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub recursive: bool,
    /// Corpora that are queried but never rebuilt.
    #[serde(default)]
    pub read_only: Vec<PathBuf>,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            dir: default_corpus_dir(),
            aggregate_dir_name: default_aggregate_dir_name(),
            cache_root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            recursive: false,
            read_only: Vec::new(),
        }
    }
}

fn default_corpus_dir() -> PathBuf {
    PathBuf::from("./corpus")
}
fn default_aggregate_dir_name() -> String {
    AGGREGATE_DIR_NAME.to_string()
}
fn default_include_globs() -> Vec<String> {
    vec!["*.pdf".to_string(), "*.txt".to_string(), "*.md".to_string()]
}

impl CorpusConfig {
    pub fn aggregate_dir(&self, corpus_dir: &Path) -> PathBuf {
        corpus_dir.join(&self.aggregate_dir_name)
    }

    pub fn cache_root(&self, corpus_dir: &Path) -> PathBuf {
        self.cache_root
            .clone()
            .unwrap_or_else(|| corpus_dir.to_path_buf())
    }

    pub fn is_read_only(&self, corpus_dir: &Path) -> bool {
        let wanted = normalize(corpus_dir);
        self.read_only.iter().any(|p| normalize(p) == wanted)
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1200
}
fn default_chunk_overlap() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_remote(&self) -> bool {
        self.provider == "openai"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    #[serde(default = "default_safe_threshold_percent")]
    pub safe_threshold_percent: u8,
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            dir: default_cache_dir(),
            prefix: default_cache_prefix(),
            ttl_hours: default_ttl_hours(),
            safe_threshold_percent: default_safe_threshold_percent(),
            min_free_space_mb: default_min_free_space_mb(),
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}
fn default_cache_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}
fn default_cache_prefix() -> String {
    "cidx_index".to_string()
}
fn default_ttl_hours() -> u64 {
    24
}
fn default_safe_threshold_percent() -> u8 {
    80
}
fn default_min_free_space_mb() -> u64 {
    500
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.saturating_mul(3600))
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.min_free_space_mb.saturating_mul(BYTES_PER_MB)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MergeConfig {
    #[serde(default = "default_merge_batch_size")]
    pub batch_size: usize,
    /// Batch merging switches on automatically above this many sources.
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,
    #[serde(default = "default_hash_chunk_size")]
    pub hash_chunk_size: usize,
    #[serde(default = "default_true")]
    pub atomic: bool,
    #[serde(default = "default_true")]
    pub backup: bool,
    #[serde(default)]
    pub keep_batches: bool,
    /// Orphan cleanup asks for confirmation above this many folders.
    #[serde(default = "default_orphan_confirm_threshold")]
    pub orphan_confirm_threshold: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_merge_batch_size(),
            batch_threshold: default_batch_threshold(),
            hash_chunk_size: default_hash_chunk_size(),
            atomic: true,
            backup: true,
            keep_batches: false,
            orphan_confirm_threshold: default_orphan_confirm_threshold(),
        }
    }
}

fn default_merge_batch_size() -> usize {
    100
}
fn default_batch_threshold() -> usize {
    500
}
fn default_hash_chunk_size() -> usize {
    crate::hashing::DEFAULT_HASH_CHUNK_SIZE
}
fn default_true() -> bool {
    true
}
fn default_orphan_confirm_threshold() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            timeout_secs: default_query_timeout_secs(),
            top_k: default_top_k(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}
fn default_query_timeout_secs() -> u64 {
    30
}
fn default_top_k() -> usize {
    3
}

impl Config {
    /// Defaults rooted at the given corpus directory.
    pub fn for_corpus(dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.corpus.dir = dir.into();
        config
    }

    /// Apply `CIDX_*` overrides. `lookup` is usually `std::env::var(..).ok()`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), IndexError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CIDX_CACHE_ENABLED") {
            self.cache.enabled = parse_bool("CIDX_CACHE_ENABLED", &v)?;
        }
        if let Some(v) = lookup("CIDX_CACHE_DIR") {
            self.cache.dir = PathBuf::from(v);
        }
        override_parsed(&lookup, "CIDX_CACHE_TTL_HOURS", &mut self.cache.ttl_hours)?;
        override_parsed(
            &lookup,
            "CIDX_CACHE_SAFE_THRESHOLD_PERCENT",
            &mut self.cache.safe_threshold_percent,
        )?;
        override_parsed(
            &lookup,
            "CIDX_CACHE_MIN_FREE_SPACE_MB",
            &mut self.cache.min_free_space_mb,
        )?;
        override_parsed(&lookup, "CIDX_BATCH_SIZE", &mut self.merge.batch_size)?;
        override_parsed(&lookup, "CIDX_BATCH_THRESHOLD", &mut self.merge.batch_threshold)?;
        override_parsed(&lookup, "CIDX_HASH_CHUNK_SIZE", &mut self.merge.hash_chunk_size)?;
        override_parsed(&lookup, "CIDX_QUERY_WORKERS", &mut self.query.max_workers)?;
        override_parsed(&lookup, "CIDX_QUERY_TIMEOUT_SECS", &mut self.query.timeout_secs)?;
        override_parsed(&lookup, "CIDX_TOP_K", &mut self.query.top_k)?;
        override_parsed(&lookup, "CIDX_CHUNK_SIZE", &mut self.chunking.chunk_size)?;
        override_parsed(&lookup, "CIDX_CHUNK_OVERLAP", &mut self.chunking.chunk_overlap)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        let invalid = |msg: String| Err(IndexError::ConfigInvalid(msg));

        if self.chunking.chunk_size == 0 {
            return invalid("chunking.chunk_size must be > 0".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return invalid(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            ));
        }

        if !(1..=MAX_TTL_HOURS).contains(&self.cache.ttl_hours) {
            return invalid(format!(
                "cache.ttl_hours must be in 1..={MAX_TTL_HOURS}, got {}",
                self.cache.ttl_hours
            ));
        }
        if self.cache.min_free_space_mb.checked_mul(BYTES_PER_MB).is_none() {
            return invalid(format!(
                "cache.min_free_space_mb is too large: {}",
                self.cache.min_free_space_mb
            ));
        }
        if !(1..=100).contains(&self.cache.safe_threshold_percent) {
            return invalid(format!(
                "cache.safe_threshold_percent must be in 1..=100, got {}",
                self.cache.safe_threshold_percent
            ));
        }
        if self.cache.prefix.is_empty() || self.cache.prefix.contains('/') {
            return invalid("cache.prefix must be a non-empty file name prefix".into());
        }

        if self.merge.batch_size == 0 {
            return invalid("merge.batch_size must be > 0".into());
        }
        if self.merge.hash_chunk_size == 0 {
            return invalid("merge.hash_chunk_size must be > 0".into());
        }

        if self.query.max_workers == 0 {
            return invalid("query.max_workers must be > 0".into());
        }
        if self.query.top_k == 0 {
            return invalid("query.top_k must be > 0".into());
        }
        if self.query.timeout_secs == 0 {
            return invalid("query.timeout_secs must be > 0".into());
        }

        if self.corpus.aggregate_dir_name.is_empty() || self.corpus.aggregate_dir_name.contains('/')
        {
            return invalid("corpus.aggregate_dir_name must be a plain directory name".into());
        }

        match self.embedding.provider.as_str() {
            "hash" => {
                if self.embedding.dims == Some(0) {
                    return invalid("embedding.dims must be > 0".into());
                }
            }
            "openai" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    return invalid(format!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    ));
                }
                if self.embedding.model.is_none() {
                    return invalid(format!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    ));
                }
            }
            other => {
                return invalid(format!(
                    "Unknown embedding provider: '{}'. Must be hash or openai.",
                    other
                ))
            }
        }
        if self.embedding.batch_size == 0 {
            return invalid("embedding.batch_size must be > 0".into());
        }

        Ok(())
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, slot: &mut T) -> Result<(), IndexError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| IndexError::ConfigInvalid(format!("{key}={raw:?}: {e}")))?;
    }
    Ok(())
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, IndexError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(IndexError::ConfigInvalid(format!(
            "{key}={raw:?}: expected true or false"
        ))),
    }
}

/// Read a config file, apply `CIDX_*` environment overrides, and validate.
///
/// `None` means "use defaults": no file is read.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse config file")?
        }
        None => Config::default(),
    };

    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
