//! Qdrant vector database integration
//!
//! Each entry becomes one point. The point id is a UUIDv5 derived from the
//! entry id, and the payload holds `{id, document, metadata}` so filters
//! address metadata keys as `metadata.<key>`.

use super::{
    rank, validate_dimension, validate_upsert, IndexDocument, IndexMatch, Metadata,
    MetadataFilter, VectorIndex,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    GetCollectionInfoResponse, GetPointsBuilder, ListValue, PointId, PointStruct,
    ScrollPointsBuilder, SearchPointsBuilder, Struct, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

const PAYLOAD_ID: &str = "id";
const PAYLOAD_DOCUMENT: &str = "document";
const PAYLOAD_METADATA: &str = "metadata";

/// Qdrant-backed index handle
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    dimension: usize,
}

/// Stable point id for an entry id
pub fn point_id_for(entry_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, entry_id.as_bytes())
}

impl QdrantIndex {
    /// Build a client without touching the server
    pub fn new(
        url: &str,
        api_key: Option<String>,
        collection: &str,
        dimension: usize,
    ) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let client = Qdrant::from_url(url)
            .api_key(api_key)
            .skip_compatibility_check()
            .build()
            .map_err(|e| Error::Index(e.to_string()))?;

        Ok(Self {
            client,
            collection: collection.to_string(),
            dimension,
        })
    }

    /// Connect and make sure the collection exists with the right dimension
    pub async fn connect(
        url: &str,
        api_key: Option<String>,
        collection: &str,
        dimension: usize,
    ) -> Result<Self> {
        let index = Self::new(url, api_key, collection, dimension)?;
        index.ensure_collection().await?;
        Ok(index)
    }

    /// Create the collection if missing; never touches existing data
    pub async fn ensure_collection(&self) -> Result<()> {
        if self.client.collection_exists(&self.collection).await? {
            debug!("Collection {} already exists", self.collection);

            let info = self.client.collection_info(&self.collection).await?;
            match extract_vector_size(&info) {
                Some(size) if size as usize != self.dimension => {
                    return Err(Error::DimensionMismatch {
                        expected: size as usize,
                        actual: self.dimension,
                    });
                }
                Some(_) => {}
                None => {
                    return Err(Error::Index(format!(
                        "Collection '{}' uses named vectors, which are not supported",
                        self.collection
                    )));
                }
            }
            return Ok(());
        }

        info!(
            "Creating collection {} with dimension {}",
            self.collection, self.dimension
        );

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(
                    VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                ),
            )
            .await?;

        Ok(())
    }

    fn point_ids(ids: &[String]) -> Vec<PointId> {
        ids.iter()
            .map(|id| PointId::from(point_id_for(id).to_string()))
            .collect()
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn backend(&self) -> &'static str {
        "qdrant"
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
            "Upserting {} points to collection {}",
            ids.len(),
            self.collection
        );

        let points: Vec<PointStruct> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                PointStruct::new(
                    point_id_for(id).to_string(),
                    embeddings[i].clone(),
                    entry_payload(id, &documents[i], &metadatas[i]),
                )
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await?;
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

        debug!(
            "Searching collection {} with limit {}",
            self.collection, top_k
        );

        let mut search = SearchPointsBuilder::new(&self.collection, embedding.to_vec(), top_k as u64)
            .with_payload(true);
        if let Some(qdrant_filter) = to_qdrant_filter(filter)? {
            search = search.filter(qdrant_filter);
        }

        let response = self.client.search_points(search).await?;
        let hits = response
            .result
            .into_iter()
            .map(|point| {
                let (id, document, metadata) = decode_payload(point.payload);
                IndexMatch {
                    id,
                    document,
                    metadata,
                    distance: 1.0 - point.score,
                }
            })
            .collect();

        // Qdrant already orders by score; rank() pins tie order by id
        Ok(rank(hits, top_k))
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<IndexDocument>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection, Self::point_ids(ids)).with_payload(true),
            )
            .await?;

        let mut docs: Vec<IndexDocument> = response
            .result
            .into_iter()
            .map(|point| {
                let (id, document, metadata) = decode_payload(point.payload);
                IndexDocument {
                    id,
                    document,
                    metadata,
                }
            })
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        debug!(
            "Deleting {} points from collection {}",
            ids.len(),
            self.collection
        );

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(Self::point_ids(ids))
                    .wait(true),
            )
            .await?;
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut all_ids = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut scroll = ScrollPointsBuilder::new(&self.collection)
                .limit(1000)
                .with_payload(true)
                .with_vectors(false);
            if let Some(ref o) = offset {
                scroll = scroll.offset(o.clone());
            }

            let response = self.client.scroll(scroll).await?;
            if response.result.is_empty() {
                break;
            }

            for point in response.result {
                let (id, _, _) = decode_payload(point.payload);
                if !id.is_empty() {
                    all_ids.push(id);
                }
            }

            offset = response.next_page_offset;
            if offset.is_none() {
                break;
            }
        }

        all_ids.sort();
        Ok(all_ids)
    }

    async fn count(&self) -> Result<usize> {
        let response = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await?;
        Ok(response.result.map(|r| r.count).unwrap_or(0) as usize)
    }

    async fn reset(&self) -> Result<()> {
        if self.client.collection_exists(&self.collection).await? {
            info!("Deleting existing collection {}", self.collection);
            self.client.delete_collection(&self.collection).await?;
        }
        self.ensure_collection().await
    }
}

fn extract_vector_size(info: &GetCollectionInfoResponse) -> Option<u64> {
    let vectors_config = info
        .result
        .as_ref()?
        .config
        .as_ref()?
        .params
        .as_ref()?
        .vectors_config
        .as_ref()?;

    match vectors_config.config.as_ref()? {
        qdrant_client::qdrant::vectors_config::Config::Params(params) => Some(params.size),
        qdrant_client::qdrant::vectors_config::Config::ParamsMap(_) => None,
    }
}

/// Translate an equality filter into Qdrant `must` conditions
fn to_qdrant_filter(filter: &MetadataFilter) -> Result<Option<Filter>> {
    if filter.is_empty() {
        return Ok(None);
    }

    let mut must = Vec::new();
    for (key, value) in filter.iter() {
        let field = format!("{}.{}", PAYLOAD_METADATA, key);
        let condition = match value {
            Value::String(s) => Condition::matches(field, s.clone()),
            Value::Bool(b) => Condition::matches(field, *b),
            Value::Number(n) if n.is_i64() => {
                Condition::matches(field, n.as_i64().unwrap_or_default())
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "Qdrant filters support string, bool and integer values; got {} for '{}'",
                    other, key
                )))
            }
        };
        must.push(condition);
    }

    Ok(Some(Filter {
        must,
        should: vec![],
        must_not: vec![],
        min_should: None,
    }))
}

fn entry_payload(id: &str, document: &str, metadata: &Metadata) -> HashMap<String, QdrantValue> {
    let mut payload = HashMap::new();
    payload.insert(PAYLOAD_ID.to_string(), string_to_qdrant(id));
    payload.insert(PAYLOAD_DOCUMENT.to_string(), string_to_qdrant(document));
    payload.insert(
        PAYLOAD_METADATA.to_string(),
        qdrant_from_json(&Value::Object(metadata.clone())),
    );
    payload
}

fn decode_payload(payload: HashMap<String, QdrantValue>) -> (String, String, Metadata) {
    let mut id = String::new();
    let mut document = String::new();
    let mut metadata = Metadata::new();

    for (key, value) in payload {
        match (key.as_str(), json_from_qdrant_value(value)) {
            (PAYLOAD_ID, Value::String(s)) => id = s,
            (PAYLOAD_DOCUMENT, Value::String(s)) => document = s,
            (PAYLOAD_METADATA, Value::Object(map)) => metadata = map,
            _ => {}
        }
    }
    (id, document, metadata)
}

fn string_to_qdrant(s: &str) -> QdrantValue {
    QdrantValue {
        kind: Some(Kind::StringValue(s.to_string())),
    }
}

/// Convert a serde_json value to a Qdrant payload value
fn qdrant_from_json(value: &Value) -> QdrantValue {
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(qdrant_from_json).collect(),
        }),
        Value::Object(map) => Kind::StructValue(Struct {
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), qdrant_from_json(v)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

/// Convert a Qdrant value to serde_json Value
fn json_from_qdrant_value(v: QdrantValue) -> Value {
    match v.kind {
        Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::Number(i.into()),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => Value::Array(
            list.values
                .into_iter()
                .map(json_from_qdrant_value)
                .collect(),
        ),
        Some(Kind::StructValue(s)) => Value::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, json_from_qdrant_value(v)))
                .collect(),
        ),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_point_id_is_stable() {
        assert_eq!(point_id_for("1"), point_id_for("1"));
        assert_ne!(point_id_for("1"), point_id_for("2"));
        assert_eq!(point_id_for("1").get_version_num(), 5);
    }

    #[test]
    fn test_filter_targets_metadata_fields() {
        let filter = MetadataFilter::figure("richard-iii").eq("is_manual", true);
        let qdrant_filter = to_qdrant_filter(&filter).unwrap().unwrap();
        assert_eq!(qdrant_filter.must.len(), 2);

        assert!(to_qdrant_filter(&MetadataFilter::new()).unwrap().is_none());
        assert!(to_qdrant_filter(&MetadataFilter::new().eq("score", 0.5)).is_err());
    }

    #[test]
    fn test_payload_round_trip() {
        let metadata = json!({
            "figure_id": "anne-boleyn",
            "is_manual": true,
            "year": 1536,
            "tags": ["tudor", "queen"]
        })
        .as_object()
        .cloned()
        .unwrap();

        let payload = entry_payload("3", "Anne Boleyn was executed in 1536.", &metadata);
        let (id, document, decoded) = decode_payload(payload);

        assert_eq!(id, "3");
        assert_eq!(document, "Anne Boleyn was executed in 1536.");
        assert_eq!(decoded, metadata);
    }

    #[tokio::test]
    async fn test_upsert_rejects_dimension_mismatch() {
        let index = QdrantIndex::new("http://127.0.0.1:6334", None, "test_collection", 3)
            .expect("client should build");

        let err = index
            .upsert(
                &["1".to_string()],
                &[vec![0.1, 0.2]],
                &["doc".to_string()],
                &[Metadata::new()],
            )
            .await
            .expect_err("should reject mismatched vector length");

        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }
}
