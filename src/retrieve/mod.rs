//! Figure-scoped retrieval over the vector index

use crate::config::QueryConfig;
use crate::embed::{is_zero_vector, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::store::{IndexMatch, Metadata, MetadataFilter, VectorIndex};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// One retrieved passage, most relevant first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub distance: f32,
}

impl From<IndexMatch> for RetrievalResult {
    fn from(hit: IndexMatch) -> Self {
        Self {
            id: hit.id,
            content: hit.document,
            metadata: hit.metadata,
            distance: hit.distance,
        }
    }
}

/// Stateless query front-end; cheap to clone and share across tasks
#[derive(Clone)]
pub struct Retriever {
    embedder: EmbeddingProvider,
    index: Arc<dyn VectorIndex>,
    max_top_k: usize,
}

impl Retriever {
    pub fn new(embedder: EmbeddingProvider, index: Arc<dyn VectorIndex>, config: &QueryConfig) -> Self {
        Self {
            embedder,
            index,
            max_top_k: config.max_top_k,
        }
    }

    /// Up to `top_k` passages for `figure_id`, ordered by ascending distance.
    ///
    /// An unknown figure yields an empty list. A query that embeds to the
    /// zero vector (blank text or a failed embedding) also yields an empty
    /// list, since it carries no direction to rank by.
    pub async fn search(&self, query: &str, figure_id: &str, top_k: usize) -> Result<Vec<RetrievalResult>> {
        if top_k == 0 {
            return Err(Error::InvalidArgument("top_k must be a positive integer".to_string()));
        }
        let limit = if top_k > self.max_top_k {
            warn!(requested = top_k, max = self.max_top_k, "Clamping top_k");
            self.max_top_k
        } else {
            top_k
        };

        let embedding = self.embedder.embed(query).await;
        if is_zero_vector(&embedding) {
            warn!(figure = %figure_id, query = %query, "Query has no usable embedding; returning no results");
            return Ok(Vec::new());
        }

        let hits = self
            .index
            .query(&embedding, &MetadataFilter::figure(figure_id), limit)
            .await?;

        info!(figure = %figure_id, query = %query, retrieved = hits.len(), "Retrieved context");

        Ok(hits.into_iter().map(RetrievalResult::from).collect())
    }
}
