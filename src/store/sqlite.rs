//! Embedded [`VectorIndex`] backed by a SQLite file.
//!
//! Vectors are stored as little-endian `f32` BLOBs and searched by
//! brute-force cosine distance. Several collections may share one file;
//! each remembers the dimension it was created with.

use super::{
    rank, validate_dimension, validate_upsert, IndexDocument, IndexMatch, Metadata,
    MetadataFilter, VectorIndex,
};
use crate::db;
use crate::embed::cosine_distance;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::{QueryBuilder, Sqlite};
use std::path::Path;
use tracing::{debug, info};

const INDEX_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    dimension INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS index_entries (
    collection TEXT NOT NULL REFERENCES collections(name),
    id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    document TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_index_entries_figure
    ON index_entries(collection, json_extract(metadata_json, '$.figure_id'));
"#;

/// Encode a vector as a little-endian `f32` BLOB
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`]
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

type EntryRow = (String, Vec<u8>, String, String);

/// Add `AND json_extract(..) = ?` for each filter pair SQLite can compare.
///
/// Only plain keys with scalar values are pushed down; the caller still runs
/// [`MetadataFilter::matches`] on every row, which decides type-exact equality.
fn push_metadata_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &MetadataFilter) {
    for (key, value) in filter.iter() {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        let column = format!(" AND json_extract(metadata_json, '$.{}') = ", key);
        match value {
            Value::String(s) => {
                qb.push(column);
                qb.push_bind(s.clone());
            }
            Value::Bool(b) => {
                qb.push(column);
                qb.push_bind(i64::from(*b));
            }
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    qb.push(column);
                    qb.push_bind(i);
                } else if let Some(f) = n.as_f64() {
                    qb.push(column);
                    qb.push_bind(f);
                }
            }
            _ => {}
        }
    }
}

pub struct SqliteIndex {
    pool: SqlitePool,
    collection: String,
    dimension: usize,
}

impl SqliteIndex {
    /// Open `collection` inside the database at `path`.
    ///
    /// Creates the file and collection if missing. Reopening keeps existing
    /// entries; reopening with a different dimension is an error.
    pub async fn open(path: &Path, collection: &str, dimension: usize) -> Result<Self> {
        let pool = db::connect(path).await?;
        Self::with_pool(pool, collection, dimension).await
    }

    pub async fn with_pool(pool: SqlitePool, collection: &str, dimension: usize) -> Result<Self> {
        sqlx::query(INDEX_SCHEMA_SQL).execute(&pool).await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT dimension FROM collections WHERE name = ?")
                .bind(collection)
                .fetch_optional(&pool)
                .await?;

        match existing {
            Some(stored) if stored as usize != dimension => {
                return Err(Error::DimensionMismatch {
                    expected: stored as usize,
                    actual: dimension,
                });
            }
            Some(_) => debug!("Collection {} already exists", collection),
            None => {
                info!(
                    "Creating collection {} with dimension {}",
                    collection, dimension
                );
                sqlx::query(
                    "INSERT INTO collections (name, dimension, created_at) VALUES (?, ?, ?)",
                )
                .bind(collection)
                .bind(dimension as i64)
                .bind(Utc::now().to_rfc3339())
                .execute(&pool)
                .await?;
            }
        }

        Ok(Self {
            pool,
            collection: collection.to_string(),
            dimension,
        })
    }

    fn decode_row(row: EntryRow) -> Result<(String, Vec<f32>, String, Metadata)> {
        let (id, blob, document, metadata_json) = row;
        let metadata: Metadata = serde_json::from_str(&metadata_json)?;
        Ok((id, blob_to_vec(&blob), document, metadata))
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn name(&self) -> &str {
        &self.collection
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
        if ids.is_empty() {
            return Ok(());
        }

        debug!(
            "Upserting {} entries to collection {}",
            ids.len(),
            self.collection
        );

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for (i, id) in ids.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO index_entries (collection, id, embedding, document, metadata_json, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    embedding = excluded.embedding,
                    document = excluded.document,
                    metadata_json = excluded.metadata_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&self.collection)
            .bind(id)
            .bind(vec_to_blob(&embeddings[i]))
            .bind(&documents[i])
            .bind(serde_json::to_string(&metadatas[i])?)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &MetadataFilter,
        top_k: usize,
    ) -> Result<Vec<IndexMatch>> {
        validate_dimension(self.dimension, [embedding.len()])?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, embedding, document, metadata_json FROM index_entries WHERE collection = ",
        );
        qb.push_bind(&self.collection);
        push_metadata_filter(&mut qb, filter);

        let rows: Vec<EntryRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, vector, document, metadata) = Self::decode_row(row)?;
            if !filter.matches(&metadata) {
                continue;
            }
            hits.push(IndexMatch {
                distance: cosine_distance(embedding, &vector),
                id,
                document,
                metadata,
            });
        }
        Ok(rank(hits, top_k))
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<IndexDocument>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, embedding, document, metadata_json FROM index_entries WHERE collection = ",
        );
        qb.push_bind(&self.collection);
        qb.push(" AND id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY id");

        let rows: Vec<EntryRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let (id, _, document, metadata) = Self::decode_row(row)?;
                Ok(IndexDocument {
                    id,
                    document,
                    metadata,
                })
            })
            .collect()
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        debug!(
            "Deleting {} entries from collection {}",
            ids.len(),
            self.collection
        );

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM index_entries WHERE collection = ");
        qb.push_bind(&self.collection);
        qb.push(" AND id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM index_entries WHERE collection = ? ORDER BY id",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM index_entries WHERE collection = ?")
                .bind(&self.collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn reset(&self) -> Result<()> {
        info!("Resetting collection {}", self.collection);
        sqlx::query("DELETE FROM index_entries WHERE collection = ?")
            .bind(&self.collection)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn figure(id: &str) -> Metadata {
        json!({ "figure_id": id, "is_manual": false })
            .as_object()
            .cloned()
            .unwrap()
    }

    async fn setup_index(dimension: usize) -> (SqliteIndex, TempDir) {
        let tmp = TempDir::new().unwrap();
        let index = SqliteIndex::open(&tmp.path().join("vectors.db"), "test", dimension)
            .await
            .unwrap();
        (index, tmp)
    }

    #[test]
    fn test_blob_round_trip() {
        let v = vec![0.25, -1.5, 3.0e-7];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[tokio::test]
    async fn test_empty_collection_queries_empty() {
        let (index, _tmp) = setup_index(2).await;
        let hits = index
            .query(&[1.0, 0.0], &MetadataFilter::figure("richard-iii"), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reopen_keeps_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vectors.db");

        {
            let index = SqliteIndex::open(&path, "figure_contexts", 2).await.unwrap();
            index
                .upsert(&["1".into()], &[vec![1.0, 0.0]], &["kept".into()], &[figure("a")])
                .await
                .unwrap();
        }

        let reopened = SqliteIndex::open(&path, "figure_contexts", 2).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        let docs = reopened.get(&["1".into()]).await.unwrap();
        assert_eq!(docs[0].document, "kept");
        assert_eq!(docs[0].metadata, figure("a"));
    }

    #[tokio::test]
    async fn test_reopen_with_other_dimension_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vectors.db");
        SqliteIndex::open(&path, "figure_contexts", 384).await.unwrap();

        let err = SqliteIndex::open(&path, "figure_contexts", 1536)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 384,
                actual: 1536
            }
        ));

        // a differently named collection in the same file is independent
        assert!(SqliteIndex::open(&path, "figure_contexts_openai", 1536)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_and_filters() {
        let (index, _tmp) = setup_index(2).await;

        index
            .upsert(
                &["1".into(), "2".into(), "3".into()],
                &[vec![1.0, 0.0], vec![0.7, 0.7], vec![1.0, 0.0]],
                &["one".into(), "two".into(), "three".into()],
                &[figure("a"), figure("a"), figure("b")],
            )
            .await
            .unwrap();
        index
            .upsert(&["1".into()], &[vec![1.0, 0.0]], &["one v2".into()], &[figure("a")])
            .await
            .unwrap();

        assert_eq!(index.count().await.unwrap(), 3);

        let hits = index
            .query(&[1.0, 0.0], &MetadataFilter::figure("a"), 10)
            .await
            .unwrap();
        let docs: Vec<&str> = hits.iter().map(|h| h.document.as_str()).collect();
        assert_eq!(docs, vec!["one v2", "two"]);
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn test_query_filters_scalar_types_exactly() {
        let (index, _tmp) = setup_index(2).await;
        let meta = |value: serde_json::Value| value.as_object().cloned().unwrap();

        index
            .upsert(
                &["1".into(), "2".into(), "3".into(), "4".into()],
                &[vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]],
                &["one".into(), "two".into(), "three".into(), "four".into()],
                &[
                    meta(json!({"figure_id": "a", "is_manual": true, "year": 1485, "source-name": "x"})),
                    meta(json!({"figure_id": "a", "is_manual": false, "year": 1483, "source-name": "y"})),
                    meta(json!({"figure_id": "a", "is_manual": 1, "year": "1485"})),
                    meta(json!({"figure_id": "b", "is_manual": true, "year": 1485})),
                ],
            )
            .await
            .unwrap();

        let ids = |hits: Vec<IndexMatch>| hits.into_iter().map(|h| h.id).collect::<Vec<_>>();

        let manual = index
            .query(&[1.0, 0.0], &MetadataFilter::figure("a").eq("is_manual", true), 10)
            .await
            .unwrap();
        assert_eq!(ids(manual), vec!["1"]);

        let year = index
            .query(&[1.0, 0.0], &MetadataFilter::figure("a").eq("year", 1485), 10)
            .await
            .unwrap();
        assert_eq!(ids(year), vec!["1"]);

        // keys SQLite cannot address directly are still honoured
        let hyphenated = index
            .query(&[1.0, 0.0], &MetadataFilter::new().eq("source-name", "y"), 10)
            .await
            .unwrap();
        assert_eq!(ids(hyphenated), vec!["2"]);

        let other = index
            .query(&[1.0, 0.0], &MetadataFilter::figure("b"), 10)
            .await
            .unwrap();
        assert_eq!(ids(other), vec!["4"]);
    }

    #[tokio::test]
    async fn test_delete_list_and_reset() {
        let (index, _tmp) = setup_index(1).await;
        index
            .upsert(
                &["b".into(), "a".into()],
                &[vec![1.0], vec![1.0]],
                &["b".into(), "a".into()],
                &[figure("x"), figure("x")],
            )
            .await
            .unwrap();

        assert_eq!(index.list_ids().await.unwrap(), vec!["a", "b"]);

        index.delete(&["a".into(), "zzz".into()]).await.unwrap();
        assert_eq!(index.list_ids().await.unwrap(), vec!["b"]);

        index.reset().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_rejects_wrong_dimension() {
        let (index, _tmp) = setup_index(3).await;
        let err = index
            .upsert(&["1".into()], &[vec![1.0]], &["x".into()], &[figure("a")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
