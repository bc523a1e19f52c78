//! Vector index storage
//!
//! This module defines the [`VectorIndex`] contract used by ingestion and
//! retrieval, plus three backends:
//! - [`QdrantIndex`]: a Qdrant collection (remote server)
//! - [`SqliteIndex`]: an embedded SQLite file with brute-force cosine search
//! - [`MemoryIndex`]: a process-local map for tests and throwaway use
//!
//! Every backend ranks by cosine distance (`1 - cosine_similarity`), so
//! results are directly comparable across backends.

mod memory;
mod qdrant;
mod sqlite;

pub use memory::MemoryIndex;
pub use qdrant::QdrantIndex;
pub use sqlite::SqliteIndex;

use crate::config::{Config, IndexBackendKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

/// Metadata stored alongside each entry
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata key every ingested entry carries and retrieval filters on
pub const FIGURE_ID_KEY: &str = "figure_id";

/// A full index entry, as written by ingestion
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: Metadata,
}

/// A stored entry without its vector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
}

/// One nearest-neighbour hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexMatch {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    /// Cosine distance to the query, lower is closer
    pub distance: f32,
}

/// Exact-match metadata filter; every pair must match (logical AND)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pairs: Metadata,
}

impl MetadataFilter {
    /// A filter that matches everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to entries of one figure
    pub fn figure(figure_id: &str) -> Self {
        Self::new().eq(FIGURE_ID_KEY, figure_id)
    }

    /// Add an equality condition
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pairs.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.pairs.iter()
    }

    /// True when `metadata` has every filtered key with an equal value
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.pairs
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

impl From<Metadata> for MetadataFilter {
    fn from(pairs: Metadata) -> Self {
        Self { pairs }
    }
}

/// Persistent, filterable nearest-neighbour index.
///
/// Implementations must allow concurrent `query` calls. Writers are expected
/// to serialise among themselves; concurrent upserts of one id are
/// last-writer-wins.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Backend name for logs and status output
    fn backend(&self) -> &'static str;

    /// Collection name
    fn name(&self) -> &str;

    /// Vector dimension every entry must have
    fn dimension(&self) -> usize;

    /// Insert or overwrite entries by id.
    ///
    /// All four slices must have the same length and ids must be unique
    /// within the call.
    async fn upsert(
        &self,
        ids: &[String],
        embeddings: &[Vec<f32>],
        documents: &[String],
        metadatas: &[Metadata],
    ) -> Result<()>;

    /// Up to `top_k` entries matching `filter`, ordered by ascending distance
    async fn query(
        &self,
        embedding: &[f32],
        filter: &MetadataFilter,
        top_k: usize,
    ) -> Result<Vec<IndexMatch>>;

    /// Fetch stored entries by id; missing ids are skipped
    async fn get(&self, ids: &[String]) -> Result<Vec<IndexDocument>>;

    /// Remove entries by id; missing ids are ignored
    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Every id in the collection
    async fn list_ids(&self) -> Result<Vec<String>>;

    async fn count(&self) -> Result<usize>;

    /// Drop every entry and recreate the empty collection
    async fn reset(&self) -> Result<()>;

    /// Convenience wrapper over [`upsert`](Self::upsert)
    async fn upsert_entries(&self, entries: Vec<IndexEntry>) -> Result<()> {
        let mut ids = Vec::with_capacity(entries.len());
        let mut embeddings = Vec::with_capacity(entries.len());
        let mut documents = Vec::with_capacity(entries.len());
        let mut metadatas = Vec::with_capacity(entries.len());
        for entry in entries {
            ids.push(entry.id);
            embeddings.push(entry.embedding);
            documents.push(entry.document);
            metadatas.push(entry.metadata);
        }
        self.upsert(&ids, &embeddings, &documents, &metadatas).await
    }
}

/// Check an upsert batch before any backend touches storage
pub(crate) fn validate_upsert(
    dimension: usize,
    ids: &[String],
    embeddings: &[Vec<f32>],
    documents: &[String],
    metadatas: &[Metadata],
) -> Result<()> {
    let n = ids.len();
    if embeddings.len() != n || documents.len() != n || metadatas.len() != n {
        return Err(Error::InvalidArgument(format!(
            "upsert requires equal lengths: ids={}, embeddings={}, documents={}, metadatas={}",
            n,
            embeddings.len(),
            documents.len(),
            metadatas.len()
        )));
    }

    let mut seen = HashSet::with_capacity(n);
    for id in ids {
        if id.is_empty() {
            return Err(Error::InvalidArgument("entry id must not be empty".to_string()));
        }
        if !seen.insert(id.as_str()) {
            return Err(Error::InvalidArgument(format!(
                "duplicate id '{}' in upsert batch",
                id
            )));
        }
    }

    validate_dimension(dimension, embeddings.iter().map(|v| v.len()))
}

/// Check that every vector length equals the index dimension
pub(crate) fn validate_dimension(
    dimension: usize,
    lengths: impl IntoIterator<Item = usize>,
) -> Result<()> {
    match lengths.into_iter().find(|len| *len != dimension) {
        Some(actual) => Err(Error::DimensionMismatch {
            expected: dimension,
            actual,
        }),
        None => Ok(()),
    }
}

/// Open the configured index backend, creating the collection if needed.
///
/// Any failure is reported as [`Error::IndexUnavailable`]: retrieval cannot
/// work without the index, so callers treat it as fatal at startup.
pub async fn open_index(config: &Config, dimension: usize) -> Result<Arc<dyn VectorIndex>> {
    let kind = config.index.backend_kind()?;
    let collection = config.collection_name();

    let opened: Result<Arc<dyn VectorIndex>> = match kind {
        IndexBackendKind::Sqlite => {
            SqliteIndex::open(&config.paths.index_file, &collection, dimension)
                .await
                .map(|index| Arc::new(index) as Arc<dyn VectorIndex>)
        }
        IndexBackendKind::Qdrant => QdrantIndex::connect(
            &config.index.qdrant_url,
            config.index.qdrant_api_key(),
            &collection,
            dimension,
        )
        .await
        .map(|index| Arc::new(index) as Arc<dyn VectorIndex>),
    };

    match opened {
        Ok(index) => {
            info!(
                backend = index.backend(),
                collection = index.name(),
                dimension,
                "Vector index ready"
            );
            Ok(index)
        }
        Err(e @ Error::DimensionMismatch { .. }) => Err(e),
        Err(e) => {
            error!(collection = %collection, error = %e, "Vector index unavailable");
            Err(Error::IndexUnavailable(e.to_string()))
        }
    }
}

/// Order hits by ascending distance and keep `top_k`
pub(crate) fn rank(mut hits: Vec<IndexMatch>, top_k: usize) -> Vec<IndexMatch> {
    hits.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(top_k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_matches_all_pairs() {
        let metadata = meta(json!({"figure_id": "richard-iii", "is_manual": true}));

        assert!(MetadataFilter::new().matches(&metadata));
        assert!(MetadataFilter::figure("richard-iii").matches(&metadata));
        assert!(MetadataFilter::figure("richard-iii")
            .eq("is_manual", true)
            .matches(&metadata));
        assert!(!MetadataFilter::figure("richard-iii")
            .eq("is_manual", false)
            .matches(&metadata));
        assert!(!MetadataFilter::figure("anne-boleyn").matches(&metadata));
        assert!(!MetadataFilter::new().eq("missing", "x").matches(&metadata));
    }

    #[test]
    fn test_filter_compares_types_exactly() {
        let metadata = meta(json!({"year": 1485}));
        assert!(MetadataFilter::new().eq("year", 1485).matches(&metadata));
        assert!(!MetadataFilter::new().eq("year", "1485").matches(&metadata));
    }

    #[test]
    fn test_validate_upsert_rejects_bad_batches() {
        let ids = vec!["1".to_string(), "2".to_string()];
        let docs = vec!["a".to_string(), "b".to_string()];
        let metas = vec![Metadata::new(), Metadata::new()];

        assert!(validate_upsert(2, &ids, &[vec![1.0, 0.0], vec![0.0, 1.0]], &docs, &metas).is_ok());

        assert!(matches!(
            validate_upsert(2, &ids, &[vec![1.0, 0.0]], &docs, &metas),
            Err(Error::InvalidArgument(_))
        ));

        let dup = vec!["1".to_string(), "1".to_string()];
        assert!(matches!(
            validate_upsert(2, &dup, &[vec![1.0, 0.0], vec![0.0, 1.0]], &docs, &metas),
            Err(Error::InvalidArgument(_))
        ));

        assert!(matches!(
            validate_upsert(2, &ids, &[vec![1.0, 0.0], vec![1.0]], &docs, &metas),
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    fn open_err(result: Result<Arc<dyn VectorIndex>>) -> Error {
        match result {
            Ok(index) => panic!("expected an error, opened {}", index.name()),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn test_open_index_unusable_storage_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_base_dir(tmp.path().to_path_buf());
        std::fs::write(&config.paths.index_file, vec![b'x'; 4096]).unwrap();

        let err = open_err(open_index(&config, 4).await);
        assert!(matches!(err, Error::IndexUnavailable(_)));

        let mut config = Config::with_base_dir(tmp.path().to_path_buf());
        config.paths.index_file = tmp.path().join("a_directory");
        std::fs::create_dir(&config.paths.index_file).unwrap();
        let err = open_err(open_index(&config, 4).await);
        assert!(matches!(err, Error::IndexUnavailable(_)));
    }

    #[tokio::test]
    async fn test_open_index_passes_dimension_mismatch_through() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_base_dir(tmp.path().to_path_buf());

        let index = open_index(&config, 4).await.ok().unwrap();
        assert_eq!(index.dimension(), 4);

        let err = open_err(open_index(&config, 8).await);
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 4,
                actual: 8
            }
        ));
    }

    #[test]
    fn test_rank_orders_and_truncates() {
        let hit = |id: &str, distance: f32| IndexMatch {
            id: id.to_string(),
            document: String::new(),
            metadata: Metadata::new(),
            distance,
        };
        let ranked = rank(vec![hit("c", 0.9), hit("a", 0.1), hit("b", 0.5)], 2);
        let ids: Vec<&str> = ranked.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
