//! In-memory [`VectorIndex`] for tests and ephemeral use.
//!
//! Entries live in a `HashMap` behind an async `RwLock`; search is
//! brute-force cosine distance over every entry.

use super::{
    rank, validate_dimension, validate_upsert, IndexDocument, IndexMatch, Metadata,
    MetadataFilter, VectorIndex,
};
use crate::embed::cosine_distance;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct StoredEntry {
    embedding: Vec<f32>,
    document: String,
    metadata: Metadata,
}

pub struct MemoryIndex {
    name: String,
    dimension: usize,
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryIndex {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(
        &self,
        ids: &[String],
        embeddings: &[Vec<f32>],
        documents: &[String],
        metadatas: &[Metadata],
    ) -> Result<()> {
        validate_upsert(self.dimension, ids, embeddings, documents, metadatas)?;

        let mut entries = self.entries.write().await;
        for i in 0..ids.len() {
            entries.insert(
                ids[i].clone(),
                StoredEntry {
                    embedding: embeddings[i].clone(),
                    document: documents[i].clone(),
                    metadata: metadatas[i].clone(),
                },
            );
        }
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &MetadataFilter,
        top_k: usize,
    ) -> Result<Vec<IndexMatch>> {
        validate_dimension(self.dimension, [embedding.len()])?;

        let entries = self.entries.read().await;
        let hits = entries
            .iter()
            .filter(|(_, entry)| filter.matches(&entry.metadata))
            .map(|(id, entry)| IndexMatch {
                id: id.clone(),
                document: entry.document.clone(),
                metadata: entry.metadata.clone(),
                distance: cosine_distance(embedding, &entry.embedding),
            })
            .collect();
        Ok(rank(hits, top_k))
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<IndexDocument>> {
        let entries = self.entries.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                entries.get(id).map(|entry| IndexDocument {
                    id: id.clone(),
                    document: entry.document.clone(),
                    metadata: entry.metadata.clone(),
                })
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut entries = self.entries.write().await;
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn reset(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    fn figure(id: &str) -> Metadata {
        json!({ "figure_id": id }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_query_empty_index() {
        let index = MemoryIndex::new("test", 2);
        let hits = index
            .query(&[1.0, 0.0], &MetadataFilter::figure("nobody"), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_by_id() {
        let index = MemoryIndex::new("test", 2);
        index
            .upsert(&["1".into()], &[vec![1.0, 0.0]], &["A".into()], &[figure("x")])
            .await
            .unwrap();
        index
            .upsert(&["1".into()], &[vec![0.0, 1.0]], &["B".into()], &[figure("x")])
            .await
            .unwrap();

        assert_eq!(index.count().await.unwrap(), 1);
        let docs = index.get(&["1".into()]).await.unwrap();
        assert_eq!(docs[0].document, "B");
    }

    #[tokio::test]
    async fn test_query_filters_and_ranks() {
        let index = MemoryIndex::new("test", 2);
        index
            .upsert(
                &["near".into(), "far".into(), "other".into()],
                &[vec![1.0, 0.1], vec![0.0, 1.0], vec![1.0, 0.0]],
                &["near".into(), "far".into(), "other".into()],
                &[figure("a"), figure("a"), figure("b")],
            )
            .await
            .unwrap();

        let hits = index
            .query(&[1.0, 0.0], &MetadataFilter::figure("a"), 10)
            .await
            .unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn test_query_rejects_wrong_dimension() {
        let index = MemoryIndex::new("test", 3);
        let err = index
            .query(&[1.0, 0.0], &MetadataFilter::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[tokio::test]
    async fn test_delete_and_reset() {
        let index = MemoryIndex::new("test", 1);
        index
            .upsert(
                &["1".into(), "2".into()],
                &[vec![1.0], vec![1.0]],
                &["a".into(), "b".into()],
                &[figure("x"), figure("x")],
            )
            .await
            .unwrap();

        index.delete(&["1".into(), "missing".into()]).await.unwrap();
        assert_eq!(index.list_ids().await.unwrap(), vec!["2".to_string()]);

        index.reset().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
