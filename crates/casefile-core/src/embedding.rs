//! Embedder trait and vector utilities.
//!
//! Defines the async [`Embedder`] trait that all embedding backends
//! implement, plus pure helper functions for vector serialization,
//! similarity computation, and batched embedding with shape checks.
//!
//! Concrete providers (OpenAI, Ollama) live in the `casefile` app crate.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed `texts` in batches of `batch_size`, checking every batch.
///
/// Fails with [`Error::EmbeddingBatchFailed`] when a batch returns the
/// wrong number of vectors or a vector of the wrong dimensionality.
pub async fn embed_all<E: Embedder + ?Sized>(
    embedder: &E,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let dims = embedder.dims();
    let mut out = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embedder.embed(batch).await?;
        if vectors.len() != batch.len() {
            return Err(Error::EmbeddingBatchFailed(format!(
                "expected {} vectors, got {}",
                batch.len(),
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(Error::EmbeddingBatchFailed(format!(
                "expected {} dimensions, got {}",
                dims,
                bad.len()
            )));
        }
        out.extend(vectors);
    }

    Ok(out)
}

/// Embed a single query string.
pub async fn embed_query<E: Embedder + ?Sized>(embedder: &E, query: &str) -> Result<Vec<f32>> {
    let mut vectors = embed_all(embedder, &[query.to_string()], 1).await?;
    vectors
        .pop()
        .ok_or_else(|| Error::EmbeddingBatchFailed("no vector for query".to_string()))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use casefile_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero vector.
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
