//! Embedding boundary and vector math.
//!
//! Model inference is not part of the kernel; callers inject an [`Embedder`].
//! Vector-dependent paths fall back to text scoring when no embedder or
//! embedding is available.

use async_trait::async_trait;

use crate::error::Result;

/// Injected `embed(text) -> vector` capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Output dimension.
    fn dimension(&self) -> usize;
}

/// Dot product over the common prefix.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Euclidean norm.
pub fn norm(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity given a precomputed norm of `b`.
///
/// `None` on dimension mismatch or a zero vector.
pub fn cosine_with_norm(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() || a_norm == 0.0 || b_norm == 0.0 {
        return None;
    }
    Some(dot(a, b) / (a_norm * b_norm))
}

/// Cosine similarity. `None` on dimension mismatch or a zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    cosine_with_norm(a, norm(a), b, norm(b))
}

/// Deterministic bag-of-tokens embedder (feature hashing), for tests and
/// deployments without a model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Create an embedder of the given dimension (minimum 1).
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Synchronous embedding.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in crate::text::tokenize(text) {
            let h = xxhash_rust::xxh64::xxh64(token.as_bytes(), 0);
            vector[(h % self.dimension as u64) as usize] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(16);
        let a = embedder.embed("Acme Corp").await.unwrap();
        let b = embedder.embed("acme corp").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }
}
