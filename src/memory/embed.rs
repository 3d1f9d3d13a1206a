//! Embedding collaborator.
//!
//! The engine treats embeddings as an opaque async `text -> vector` call.
//! [`HashingEmbedder`] is the built-in provider: token and character-trigram
//! features hashed into a fixed number of buckets and L2-normalized.

use std::hash::{DefaultHasher, Hash, Hasher};

use async_trait::async_trait;

use crate::error::EmbedError;
use crate::metrics::tokenize;
use crate::sequence::char_ngrams;

/// Result type for embedding calls.
pub type EmbedResult<T> = std::result::Result<T, EmbedError>;

/// Default dimensionality of [`HashingEmbedder`].
pub const DEFAULT_DIM: usize = 64;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Length of every returned vector.
    fn dim(&self) -> usize;

    async fn embed(&self, text: &str) -> EmbedResult<Vec<f64>>;
}

/// Feature-hashing embedder.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIM)
    }
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn bucket(&self, feature: &str) -> (usize, f64) {
        let mut h = DefaultHasher::new();
        feature.hash(&mut h);
        let v = h.finish();
        let sign = if v >> 63 == 0 { 1.0 } else { -1.0 };
        ((v % self.dim as u64) as usize, sign)
    }

    /// Synchronous embedding, also used by the async trait method.
    pub fn embed_sync(&self, text: &str) -> Vec<f64> {
        let mut out = vec![0.0; self.dim];
        for tok in tokenize(text) {
            let tok = tok.to_lowercase();
            let (i, s) = self.bucket(&tok);
            out[i] += s;
            for gram in char_ngrams(&tok, 3) {
                let (i, s) = self.bucket(&format!("#{gram}"));
                out[i] += 0.5 * s;
            }
        }
        let norm = out.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            for x in &mut out {
                *x /= norm;
            }
        }
        out
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> EmbedResult<Vec<f64>> {
        Ok(self.embed_sync(text))
    }
}

/// Embed `text` and check the returned dimension.
pub async fn embed_checked(provider: &dyn EmbeddingProvider, text: &str) -> EmbedResult<Vec<f64>> {
    let v = provider.embed(text).await?;
    if v.len() != provider.dim() {
        return Err(EmbedError::Dimension {
            expected: provider.dim(),
            actual: v.len(),
        });
    }
    Ok(v)
}
