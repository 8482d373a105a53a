//! Text-to-vector contract and the default Model2Vec implementation.
//!
//! Every output vector has the same fixed dimension, probed from the model at
//! load time and pinned for the life of the vector store. Swapping models
//! with a different dimension requires a full rebuild.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use model2vec_rs::model::StaticModel;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    /// Embed a batch. Deterministic for a given model revision; failures are
    /// transient and the caller retries the whole batch.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().context("embedder returned empty batch")
    }
}

/// In-process static embedding model (Model2Vec distillations). CPU-bound,
/// so encoding always runs under `spawn_blocking`.
pub struct Model2VecEmbedder {
    model: Arc<StaticModel>,
    dim: usize,
}

impl Model2VecEmbedder {
    /// Load the model eagerly and probe its output dimension. When
    /// `expected_dim` is set (an existing store), a mismatch is fatal.
    pub async fn load(model_id: &str, expected_dim: Option<usize>) -> Result<Model2VecEmbedder> {
        let id = model_id.to_string();
        let (model, dim) = tokio::task::spawn_blocking(move || -> Result<(StaticModel, usize)> {
            let model = StaticModel::from_pretrained(&id, None, None, None)
                .with_context(|| format!("loading Model2Vec model '{}'", id))?;
            let probe = model.encode_single("dimension probe");
            Ok((model, probe.len()))
        })
        .await
        .context("Model2Vec init task failed")??;

        if let Some(expected) = expected_dim {
            if expected != dim {
                bail!(
                    "embedding model '{}' emits {}-dim vectors but the store is pinned to {} — \
                     a full rebuild is required to switch models",
                    model_id,
                    dim,
                    expected
                );
            }
        }
        tracing::info!("embedding model '{}' loaded (dim: {})", model_id, dim);

        Ok(Model2VecEmbedder {
            model: Arc::new(model),
            dim,
        })
    }
}

#[async_trait]
impl Embedder for Model2VecEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model.clone();
        let owned: Vec<String> = texts.to_vec();
        let dim = self.dim;
        let vectors = tokio::task::spawn_blocking(move || model.encode(&owned))
            .await
            .context("embedding task failed")?;
        for v in &vectors {
            if v.len() != dim {
                bail!("embedding dimension drifted: expected {}, got {}", dim, v.len());
            }
        }
        Ok(vectors)
    }
}

/// Deterministic feature-hashing embedder: no model download, same text →
/// same vector. A coarse offline fallback, and the fixture embedder in tests.
pub struct HashEmbedder {
    pub dim: usize,
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; self.dim];
                for token in t.to_lowercase().split_whitespace() {
                    let mut h: u64 = 1469598103934665603;
                    for b in token.bytes() {
                        h ^= b as u64;
                        h = h.wrapping_mul(1099511628211);
                    }
                    v[(h % self.dim as u64) as usize] += 1.0;
                }
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    v.iter_mut().for_each(|x| *x /= norm);
                }
                v
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder { dim: 32 };
        let a = e.embed_one("tokio async runtime").await.unwrap();
        let b = e.embed_one("tokio async runtime").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn similar_texts_score_higher_than_unrelated() {
        let e = HashEmbedder { dim: 64 };
        let q = e.embed_one("oauth token authentication").await.unwrap();
        let near = e.embed_one("token based oauth flows").await.unwrap();
        let far = e.embed_one("gardening with unicorns").await.unwrap();
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&q, &near) > dot(&q, &far));
    }
}
