//! Embedding generation
//!
//! This module provides an abstraction over embedding models with:
//! - A trait for different embedding backends
//! - Local embedding support via fastembed
//! - Remote embedding via the OpenAI embeddings API
//! - [`EmbeddingProvider`], the fail-soft front door used by ingestion and
//!   retrieval: it never returns a vector of the wrong length

#[cfg(feature = "local-embed")]
mod fastembed_impl;
mod openai;

#[cfg(feature = "local-embed")]
pub use fastembed_impl::*;
pub use openai::*;

use crate::config::{EmbeddingBackendKind, EmbeddingConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Trait for embedding backends
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Create an embedding backend based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.backend() {
        EmbeddingBackendKind::OpenAi => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        EmbeddingBackendKind::Local => {
            #[cfg(feature = "local-embed")]
            {
                Ok(Arc::new(FastEmbedder::new(config)?))
            }

            #[cfg(not(feature = "local-embed"))]
            {
                Err(Error::Embedding(
                    "No local embedding backend available. Enable the 'local-embed' feature or set embedding.use_openai = true.".to_string(),
                ))
            }
        }
    }
}

/// Fail-soft wrapper around an [`Embedder`].
///
/// Empty or missing input embeds to the zero vector. Backend failures are
/// logged and surface either as the zero vector ([`embed`](Self::embed)) or
/// as a per-item error ([`embed_batch`](Self::embed_batch)), never as a
/// vector whose length differs from [`dimension`](Self::dimension).
#[derive(Clone)]
pub struct EmbeddingProvider {
    backend: Arc<dyn Embedder>,
    batch_size: usize,
}

impl EmbeddingProvider {
    pub fn new(backend: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            backend,
            batch_size: batch_size.max(1),
        }
    }

    /// Build the backend selected by configuration and wrap it
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let backend = create_embedder(config)?;
        debug!(
            backend = %config.backend(),
            model = backend.model_name(),
            dimension = backend.dimension(),
            "Embedding provider ready"
        );
        Ok(Self::new(backend, config.batch_size))
    }

    /// Dimension of every vector this provider returns
    pub fn dimension(&self) -> usize {
        self.backend.dimension()
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn zero_vector(&self) -> Vec<f32> {
        vec![0.0; self.dimension()]
    }

    /// Embed a single text.
    ///
    /// Accepts `&str` or `Option<&str>`; `None`, empty, and whitespace-only
    /// input yield the zero vector. Backend errors are logged and also yield
    /// the zero vector.
    pub async fn embed<'a>(&self, text: impl Into<Option<&'a str>>) -> Vec<f32> {
        let Some(text) = text.into().filter(|t| !is_blank(t)) else {
            return self.zero_vector();
        };

        match self.embed_one(text).await {
            Ok(vector) => vector,
            Err(e) => {
                error!(
                    model = self.model_name(),
                    error = %e,
                    "Embedding failed; substituting zero vector"
                );
                self.zero_vector()
            }
        }
    }

    /// Embed many texts, one result per input in input order.
    ///
    /// Texts are sent in backend batches of the configured size. When a whole
    /// batch fails, its items are retried one at a time so only the bad ones
    /// come back as errors. Blank inputs map to the zero vector.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            results.extend(self.embed_chunk(batch).await);
        }
        results
    }

    async fn embed_chunk(&self, batch: &[String]) -> Vec<Result<Vec<f32>>> {
        let mut out: Vec<Result<Vec<f32>>> = batch.iter().map(|_| Ok(self.zero_vector())).collect();

        let pending: Vec<usize> = batch
            .iter()
            .enumerate()
            .filter(|(_, t)| !is_blank(t))
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return out;
        }

        let inputs: Vec<String> = pending.iter().map(|&i| batch[i].clone()).collect();
        match self.backend.embed(inputs).await {
            Ok(vectors) if vectors.len() == pending.len() => {
                for (&i, vector) in pending.iter().zip(vectors) {
                    out[i] = self.check_dimension(vector);
                }
                return out;
            }
            Ok(vectors) => warn!(
                expected = pending.len(),
                got = vectors.len(),
                "Embedding backend returned wrong number of vectors; retrying individually"
            ),
            Err(e) => warn!(
                count = pending.len(),
                error = %e,
                "Batch embedding failed; retrying individually"
            ),
        }

        for &i in &pending {
            out[i] = self.embed_one(&batch[i]).await;
            if let Err(e) = &out[i] {
                warn!(index = i, error = %e, "Embedding failed for item");
            }
        }
        out
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self
            .backend
            .embed(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("No embedding returned".to_string()))?;
        self.check_dimension(vector)
    }

    fn check_dimension(&self, vector: Vec<f32>) -> Result<Vec<f32>> {
        if vector.len() != self.dimension() {
            return Err(Error::DimensionMismatch {
                expected: self.dimension(),
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// True when every component is zero (or the vector is empty)
pub fn is_zero_vector(vector: &[f32]) -> bool {
    vector.iter().all(|v| *v == 0.0)
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, and zero
/// vectors.
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

/// Cosine distance (`1 - similarity`), in `[0, 2]`; lower is more relevant
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}
