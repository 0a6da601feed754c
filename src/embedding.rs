//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`HashEmbedder`]**: deterministic feature-hashing embedder; offline,
//!   no model download, used by default and in tests.
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API with batching,
//!   retry, and backoff.
//!
//! One embedder is constructed per process with [`create_embedder`] and shared
//! by reference (`Arc<dyn Embedder>`) with every component that needs vectors.
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{IndexError, Result};

/// Default vector width of the hashing embedder.
pub const DEFAULT_HASH_DIMS: usize = 384;

/// An embedding model.
///
/// Implementations are blocking; async callers run them on
/// `tokio::task::spawn_blocking`.
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, returning one vector per input in order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Embedding("no vector returned for query".into()))
    }
}

/// Offline embedder that hashes word unigrams and bigrams into a fixed-width,
/// L2-normalized vector. Identical text always yields identical vectors.
pub struct HashEmbedder {
    dims: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            model: format!("feature-hash-{}", dims.max(1)),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        for token in &tokens {
            self.add_feature(&mut vec, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vec, bigram.as_bytes(), 0.5);
        }

        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vec {
                *x /= norm;
            }
        }
        vec
    }

    fn add_feature(&self, vec: &mut [f32], feature: &[u8], weight: f32) {
        let h = fnv1a(feature);
        let slot = (h % self.dims as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vec[slot] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// OpenAI embedding provider.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    api_key: String,
    timeout: Duration,
}

impl OpenAIEmbedder {
    /// Create a new OpenAI provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            IndexError::ConfigInvalid("embedding.model required for OpenAI provider".into())
        })?;
        let dims = config.dims.ok_or_else(|| {
            IndexError::ConfigInvalid("embedding.dims required for OpenAI provider".into())
        })?;
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            IndexError::ConfigInvalid("OPENAI_API_KEY environment variable not set".into())
        })?;
        Ok(Self {
            model,
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Send one batch to `POST /v1/embeddings` with retry/backoff.
    fn embed_batch(
        &self,
        client: &reqwest::blocking::Client,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(attempt, delay_secs = delay.as_secs(), "retrying embedding request");
                std::thread::sleep(delay);
            }

            let resp = client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send();

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .map_err(|e| IndexError::Embedding(e.to_string()))?;
                        return parse_openai_response(&json);
                    }

                    let body_text = response.text().unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(format!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    return Err(IndexError::Embedding(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(IndexError::Embedding(
            last_err.unwrap_or_else(|| "Embedding failed after retries".to_string()),
        ))
    }
}

impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // The blocking client owns a runtime; it must be created and dropped
        // off the async executor, which is where `embed` always runs.
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| IndexError::Embedding(e.to_string()))?;
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(&client, batch)?);
        }
        Ok(out)
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts `data[].embedding` arrays, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| IndexError::Embedding("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                IndexError::Embedding("Invalid OpenAI response: missing embedding".into())
            })?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Create the shared [`Embedder`] for this process.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        other => Err(IndexError::ConfigInvalid(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let texts = vec!["Vector indexes cache well".to_string()];
        let a = embedder.embed(&texts).unwrap();
        let b = embedder.embed(&texts).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_ranks_overlap_higher() {
        let embedder = HashEmbedder::new(DEFAULT_HASH_DIMS);
        let query = embedder.embed_query("atomic directory rename").unwrap();
        let close = embedder
            .embed_query("the atomic rename of a directory is cheap")
            .unwrap();
        let far = embedder.embed_query("bananas grow in bunches").unwrap();
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_hash_embedder_empty_text_is_zero_vector() {
        let embedder = HashEmbedder::new(8);
        let v = embedder.embed_query("   ").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_response_missing_data() {
        let json = serde_json::json!({"object": "list"});
        assert!(parse_openai_response(&json).is_err());
    }

    #[test]
    fn test_create_embedder_default_is_hash() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.dims(), DEFAULT_HASH_DIMS);
        assert!(embedder.model_name().starts_with("feature-hash"));
    }
}
