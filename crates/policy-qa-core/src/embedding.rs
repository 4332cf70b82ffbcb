//! Embedding model trait, an offline hashing embedder, and vector utilities.
//!
//! Defines the [`EmbeddingModel`] trait every embedding backend implements.
//! Network and ONNX backends (OpenAI, Ollama, fastembed) live in the
//! `policy-qa` app crate; [`HashingEmbedder`] lives here because it is pure
//! computation and is what tests and offline setups run against.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::EmbeddingError;
use crate::models::EmbeddingVector;

/// Maps text to fixed-dimension dense vectors.
///
/// Implementations must be deterministic for a fixed model version, and
/// [`embed_batch`](EmbeddingModel::embed_batch) must return exactly what
/// calling [`embed`](EmbeddingModel::embed) on each input in order would.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Model identifier (e.g. `"all-minilm-l6-v2"`). Vectors from different
    /// model names are not comparable.
    fn model_name(&self) -> &str;
    /// Output dimensionality.
    fn dims(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError>;

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Reject empty or whitespace-only input before it reaches a provider.
pub fn ensure_embeddable(text: &str) -> Result<(), EmbeddingError> {
    if text.trim().is_empty() {
        return Err(EmbeddingError::EmptyInput);
    }
    Ok(())
}

/// Validate a batch response against the request size and model dims.
pub fn check_batch(
    vectors: &[EmbeddingVector],
    expected_len: usize,
    dims: usize,
) -> Result<(), EmbeddingError> {
    if vectors.len() != expected_len {
        return Err(EmbeddingError::BatchLength {
            expected: expected_len,
            actual: vectors.len(),
        });
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        return Err(EmbeddingError::Dimension {
            expected: dims,
            actual: v.len(),
        });
    }
    Ok(())
}

// ============ Hashing Embedder ============

/// Default dimensionality of [`HashingEmbedder`], matching MiniLM.
pub const HASHING_DIMS: usize = 384;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "if", "in", "is", "it", "my", "of", "on", "or", "the", "to", "what", "when", "where",
    "which", "who", "why", "will", "with", "you", "your",
];

/// Deterministic feature-hashing bag-of-words embedder.
///
/// Lowercases, splits on non-alphanumerics, drops stop words, folds a
/// trailing plural `s`, and counts each token into one of `dims` buckets
/// chosen by SHA-256. Requires no model download or network access.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub const MODEL_NAME: &'static str = "hashing-v1";

    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    /// Content tokens of `text`. Falls back to all tokens when every token
    /// is a stop word, so queries like "who is it" still embed.
    pub fn tokens(text: &str) -> Vec<String> {
        let all: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| fold_plural(&t.to_lowercase()))
            .collect();
        let content: Vec<String> = all
            .iter()
            .filter(|t| !STOP_WORDS.contains(&t.as_str()))
            .cloned()
            .collect();
        if content.is_empty() {
            all
        } else {
            content
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(prefix) % self.dims as u64) as usize
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(HASHING_DIMS)
    }
}

fn fold_plural(token: &str) -> String {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

#[async_trait]
impl EmbeddingModel for HashingEmbedder {
    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        ensure_embeddable(text)?;
        let tokens = Self::tokens(text);
        if tokens.is_empty() {
            return Err(EmbeddingError::NoTokens);
        }
        let mut v = vec![0.0f32; self.dims];
        for t in &tokens {
            v[self.bucket(t)] += 1.0;
        }
        normalize(&v).ok_or(EmbeddingError::NoTokens)
    }
}

// ============ Vector Utilities ============

/// Scale `v` to unit length. Returns `None` for empty, zero, or
/// non-finite vectors.
pub fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if v.is_empty() || !norm.is_finite() || norm < f32::EPSILON {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

/// Plain dot product. Equal to cosine similarity for unit vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
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

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use policy_qa_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), Some(v));
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`]. Returns `None` when the
/// length is not a multiple of 4.
pub fn blob_to_vec(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
