//! Embedding collaborator seam.
//!
//! Producing an embedding for incident text is external to the pipeline
//! substrate. The [`Embedder`] trait is the narrow interface; the built-in
//! [`FeatureHashEmbedder`] is a deterministic stand-in so the pipeline runs
//! self-contained, the same way the advisory text layer falls back to
//! deterministic templates when its model collaborator is absent.

use super::MemoryError;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Dimension of the built-in feature-hash embedding space.
pub const EMBEDDING_DIM: usize = 256;

/// External collaborator that turns text into an embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text`. Failure means the memory subsystem is degraded; the
    /// caller proceeds without historical context.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;

    /// Collaborator name for logging.
    fn name(&self) -> &'static str;
}

/// Deterministic local embedder: hashed bag of word uni/bigrams.
///
/// Not semantically deep, but stable across processes and good enough for
/// near-duplicate and shared-vocabulary matching, which is what the
/// historical-context lookup needs in a self-contained deployment.
pub struct FeatureHashEmbedder;

#[async_trait]
impl Embedder for FeatureHashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
            .map(str::to_string)
            .collect();

        if tokens.is_empty() {
            return Err(MemoryError::EmbeddingUnavailable(
                "no embeddable tokens in text".to_string(),
            ));
        }

        let mut vector = vec![0.0_f32; EMBEDDING_DIM];
        for token in &tokens {
            bump(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            bump(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        Ok(vector)
    }

    fn name(&self) -> &'static str {
        "feature-hash"
    }
}

/// Add weight to the hashed bucket for a feature, sign-split to reduce
/// collision bias.
fn bump(vector: &mut [f32], feature: &str, weight: f32) {
    let mut hasher = DefaultHasher::new();
    feature.hash(&mut hasher);
    let h = hasher.finish();
    let bucket = (h % EMBEDDING_DIM as u64) as usize;
    let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
    vector[bucket] += sign * weight;
}
