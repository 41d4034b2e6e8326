//! Qdrant-backed vector store

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::config::QdrantConfig as ClientConfig;
use qdrant_client::qdrant::{
    Condition, CreateCollection, DeletePoints, Distance, FieldCondition, Filter, Match,
    PointStruct, PointsIdsList, PointsSelector, ScrollPoints, SearchPoints, UpsertPoints,
    Value as QdrantValue, VectorParams, VectorsConfig, WithPayloadSelector,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    DocumentFilter, MetadataFilter, SearchHit, VectorRecord, VectorStore, VectorStoreError,
};
use crate::config::VectorConfig;
use crate::types::DocumentId;

/// Convert Qdrant errors to store errors with specific mappings
fn map_qdrant_error(error: qdrant_client::QdrantError) -> VectorStoreError {
    match error {
        qdrant_client::QdrantError::ResponseError { status, .. } => {
            let status_code = status.code() as u16;
            match status_code {
                404 => VectorStoreError::InvalidOperation {
                    reason: "collection or point not found".to_string(),
                },
                400 => VectorStoreError::InvalidOperation {
                    reason: "invalid request to vector backend".to_string(),
                },
                _ => VectorStoreError::Connection {
                    reason: format!("vector backend error: {}", status),
                },
            }
        }
        qdrant_client::QdrantError::ConversionError { .. } => VectorStoreError::InvalidOperation {
            reason: "data conversion error".to_string(),
        },
        _ => VectorStoreError::Connection {
            reason: format!("vector backend error: {}", error),
        },
    }
}

/// Deterministic point id so re-ingesting a chunk overwrites its old vector.
fn point_uuid(chunk_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()).to_string()
}

fn keyword_condition(key: &str, value: String) -> Condition {
    Condition {
        condition_one_of: Some(qdrant_client::qdrant::condition::ConditionOneOf::Field(
            FieldCondition {
                key: key.to_string(),
                r#match: Some(Match {
                    match_value: Some(qdrant_client::qdrant::r#match::MatchValue::Keyword(value)),
                }),
                ..Default::default()
            },
        )),
    }
}

fn text_condition(key: &str, value: String) -> Condition {
    Condition {
        condition_one_of: Some(qdrant_client::qdrant::condition::ConditionOneOf::Field(
            FieldCondition {
                key: key.to_string(),
                r#match: Some(Match {
                    match_value: Some(qdrant_client::qdrant::r#match::MatchValue::Text(value)),
                }),
                ..Default::default()
            },
        )),
    }
}

fn with_payload(enable: bool) -> WithPayloadSelector {
    WithPayloadSelector {
        selector_options: Some(
            qdrant_client::qdrant::with_payload_selector::SelectorOptions::Enable(enable),
        ),
    }
}

/// Qdrant client wrapper implementing the vector store trait
pub struct QdrantVectorStore {
    client: RwLock<Option<std::sync::Arc<Qdrant>>>,
    config: VectorConfig,
}

impl QdrantVectorStore {
    pub fn new(config: VectorConfig) -> Self {
        Self {
            client: RwLock::new(None),
            config,
        }
    }

    async fn get_client(&self) -> Result<std::sync::Arc<Qdrant>, VectorStoreError> {
        {
            let guard = self.client.read().await;
            if let Some(client) = guard.as_ref() {
                return Ok(client.clone());
            }
        }

        let mut client_config = ClientConfig::from_url(&self.config.qdrant_url);
        if let Some(api_key) = &self.config.api_key {
            client_config.api_key = Some(api_key.clone());
        }
        let client = std::sync::Arc::new(Qdrant::new(client_config).map_err(map_qdrant_error)?);

        let mut guard = self.client.write().await;
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Create the collection when it does not exist yet.
    pub async fn initialize(&self) -> Result<(), VectorStoreError> {
        let client = self.get_client().await?;
        let collections = client.list_collections().await.map_err(map_qdrant_error)?;
        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.config.collection_name);

        if !exists {
            let vectors_config = VectorsConfig {
                config: Some(qdrant_client::qdrant::vectors_config::Config::Params(
                    VectorParams {
                        size: self.config.vector_dimension as u64,
                        distance: Distance::Cosine as i32,
                        ..Default::default()
                    },
                )),
            };
            client
                .create_collection(CreateCollection {
                    collection_name: self.config.collection_name.clone(),
                    vectors_config: Some(vectors_config),
                    timeout: Some(self.config.timeout.as_secs()),
                    ..Default::default()
                })
                .await
                .map_err(map_qdrant_error)?;
            tracing::info!("Created vector collection {}", self.config.collection_name);
        }
        Ok(())
    }

    fn record_to_payload(record: &VectorRecord) -> HashMap<String, QdrantValue> {
        let mut payload = HashMap::new();
        payload.insert("chunk_id".to_string(), QdrantValue::from(record.id.clone()));
        payload.insert(
            "document_id".to_string(),
            QdrantValue::from(record.document_id.to_string()),
        );
        payload.insert(
            "project_id".to_string(),
            QdrantValue::from(record.project_id.clone()),
        );
        payload.insert(
            "embed_version".to_string(),
            QdrantValue::from(record.embed_version.clone()),
        );
        payload.insert("content".to_string(), QdrantValue::from(record.text.clone()));
        for (key, value) in &record.metadata {
            let qdrant_value = match value {
                Value::String(s) => QdrantValue::from(s.clone()),
                Value::Number(n) if n.is_i64() => QdrantValue::from(n.as_i64().unwrap_or_default()),
                Value::Number(n) => QdrantValue::from(n.as_f64().unwrap_or_default()),
                Value::Bool(b) => QdrantValue::from(*b),
                other => QdrantValue::from(other.to_string()),
            };
            payload.insert(format!("meta_{}", key), qdrant_value);
        }
        payload
    }

    fn extract_string(value: &QdrantValue) -> Option<String> {
        match &value.kind {
            Some(qdrant_client::qdrant::value::Kind::StringValue(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn payload_to_parts(
        payload: &HashMap<String, QdrantValue>,
    ) -> (String, DocumentId, String, String, String, HashMap<String, Value>) {
        let chunk_id = payload
            .get("chunk_id")
            .and_then(Self::extract_string)
            .unwrap_or_default();
        let document_id = payload
            .get("document_id")
            .and_then(Self::extract_string)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let project_id = payload
            .get("project_id")
            .and_then(Self::extract_string)
            .unwrap_or_default();
        let embed_version = payload
            .get("embed_version")
            .and_then(Self::extract_string)
            .unwrap_or_default();
        let content = payload
            .get("content")
            .and_then(Self::extract_string)
            .unwrap_or_default();

        let mut metadata = HashMap::new();
        for (key, value) in payload {
            if let Some(meta_key) = key.strip_prefix("meta_") {
                match &value.kind {
                    Some(qdrant_client::qdrant::value::Kind::StringValue(s)) => {
                        metadata.insert(meta_key.to_string(), Value::String(s.clone()));
                    }
                    Some(qdrant_client::qdrant::value::Kind::IntegerValue(i)) => {
                        metadata.insert(meta_key.to_string(), Value::from(*i));
                    }
                    Some(qdrant_client::qdrant::value::Kind::DoubleValue(d)) => {
                        metadata.insert(meta_key.to_string(), Value::from(*d));
                    }
                    Some(qdrant_client::qdrant::value::Kind::BoolValue(b)) => {
                        metadata.insert(meta_key.to_string(), Value::Bool(*b));
                    }
                    _ => {}
                }
            }
        }

        (chunk_id, document_id, project_id, embed_version, content, metadata)
    }

    fn build_filter(
        metadata_filter: Option<MetadataFilter>,
        document_filter: Option<DocumentFilter>,
    ) -> Option<Filter> {
        let mut must = Vec::new();
        let mut should = Vec::new();

        if let Some(filter) = metadata_filter {
            for (key, value) in filter.equals {
                let field = match key.as_str() {
                    "project_id" | "document_id" | "embed_version" => key.clone(),
                    other => format!("meta_{}", other),
                };
                let keyword = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                must.push(keyword_condition(&field, keyword));
            }
        }
        if let Some(filter) = document_filter {
            for term in filter.contains_any {
                should.push(text_condition("content", term));
            }
        }

        if must.is_empty() && should.is_empty() {
            None
        } else {
            Some(Filter {
                must,
                should,
                ..Default::default()
            })
        }
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn add(&self, records: Vec<VectorRecord>) -> Result<Vec<String>, VectorStoreError> {
        let client = self.get_client().await?;
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();

        let points: Vec<PointStruct> = records
            .iter()
            .map(|record| {
                PointStruct::new(
                    point_uuid(&record.id),
                    record.embedding.clone(),
                    Self::record_to_payload(record),
                )
            })
            .collect();

        client
            .upsert_points(UpsertPoints {
                collection_name: self.config.collection_name.clone(),
                wait: Some(true),
                points,
                ..Default::default()
            })
            .await
            .map_err(|e| match map_qdrant_error(e) {
                VectorStoreError::Connection { reason } => VectorStoreError::Write { reason },
                other => other,
            })?;

        Ok(ids)
    }

    async fn search(
        &self,
        query: Vec<f32>,
        n_results: usize,
        metadata_filter: Option<MetadataFilter>,
        document_filter: Option<DocumentFilter>,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        let client = self.get_client().await?;

        let result = client
            .search_points(SearchPoints {
                collection_name: self.config.collection_name.clone(),
                vector: query,
                filter: Self::build_filter(metadata_filter, document_filter),
                limit: n_results as u64,
                with_payload: Some(with_payload(true)),
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;

        let hits = result
            .result
            .iter()
            .map(|point| {
                let (chunk_id, document_id, _, _, content, metadata) =
                    Self::payload_to_parts(&point.payload);
                SearchHit {
                    id: chunk_id,
                    document_id,
                    text: content,
                    metadata,
                    // Cosine score is a similarity; hits carry distance.
                    distance: (1.0 - point.score).clamp(0.0, 2.0),
                }
            })
            .collect();

        Ok(hits)
    }

    async fn get(
        &self,
        metadata_filter: Option<MetadataFilter>,
        document_filter: Option<DocumentFilter>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<VectorRecord>, VectorStoreError> {
        let client = self.get_client().await?;

        let result = client
            .scroll(ScrollPoints {
                collection_name: self.config.collection_name.clone(),
                filter: Self::build_filter(metadata_filter, document_filter),
                limit: Some((limit + offset) as u32),
                with_payload: Some(with_payload(true)),
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;

        let records = result
            .result
            .iter()
            .skip(offset)
            .map(|point| {
                let (chunk_id, document_id, project_id, embed_version, content, metadata) =
                    Self::payload_to_parts(&point.payload);
                VectorRecord {
                    id: chunk_id,
                    document_id,
                    project_id,
                    embed_version,
                    text: content,
                    embedding: Vec::new(),
                    metadata,
                }
            })
            .collect();

        Ok(records)
    }

    async fn update(
        &self,
        _ids: Vec<String>,
        _text: Option<String>,
        _metadata: Option<HashMap<String, Value>>,
    ) -> Result<(), VectorStoreError> {
        // Qdrant points are re-upserted rather than patched in place.
        Err(VectorStoreError::InvalidOperation {
            reason: "in-place updates not supported, re-add the records".to_string(),
        })
    }

    async fn delete(&self, ids: Vec<String>) -> Result<(), VectorStoreError> {
        let client = self.get_client().await?;

        client
            .delete_points(DeletePoints {
                collection_name: self.config.collection_name.clone(),
                wait: Some(true),
                points: Some(PointsSelector {
                    points_selector_one_of: Some(
                        qdrant_client::qdrant::points_selector::PointsSelectorOneOf::Points(
                            PointsIdsList {
                                ids: ids.iter().map(|id| point_uuid(id).into()).collect(),
                            },
                        ),
                    ),
                }),
                ..Default::default()
            })
            .await
            .map_err(map_qdrant_error)?;

        Ok(())
    }

    async fn count(&self) -> Result<usize, VectorStoreError> {
        let client = self.get_client().await?;
        let info = client
            .collection_info(&self.config.collection_name)
            .await
            .map_err(map_qdrant_error)?;
        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0) as usize)
    }

    async fn reset(&self) -> Result<(), VectorStoreError> {
        let client = self.get_client().await?;
        client
            .delete_collection(&self.config.collection_name)
            .await
            .map_err(map_qdrant_error)?;
        self.initialize().await
    }

    async fn healthy(&self) -> bool {
        match self.get_client().await {
            Ok(client) => client.health_check().await.is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_uuid_deterministic() {
        let a = point_uuid("doc:0");
        let b = point_uuid("doc:0");
        let c = point_uuid("doc:1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_payload_roundtrip() {
        let record = VectorRecord {
            id: "doc:3".to_string(),
            document_id: DocumentId::new(),
            project_id: "project-9".to_string(),
            embed_version: "v2.0".to_string(),
            text: "chunk text".to_string(),
            embedding: vec![0.1, 0.2],
            metadata: HashMap::from([
                ("document_type".to_string(), Value::String("plot".to_string())),
                ("page".to_string(), Value::from(4)),
            ]),
        };

        let payload = QdrantVectorStore::record_to_payload(&record);
        let (chunk_id, document_id, project_id, embed_version, content, metadata) =
            QdrantVectorStore::payload_to_parts(&payload);

        assert_eq!(chunk_id, record.id);
        assert_eq!(document_id, record.document_id);
        assert_eq!(project_id, record.project_id);
        assert_eq!(embed_version, record.embed_version);
        assert_eq!(content, record.text);
        assert_eq!(metadata.get("document_type"), Some(&Value::String("plot".to_string())));
        assert_eq!(metadata.get("page"), Some(&Value::from(4)));
    }

    #[test]
    fn test_filter_construction() {
        let filter = QdrantVectorStore::build_filter(
            Some(MetadataFilter::new().eq("project_id", "p1").eq("document_type", "scene")),
            Some(DocumentFilter::contains_any(vec!["dragon".to_string()])),
        )
        .unwrap();
        assert_eq!(filter.must.len(), 2);
        assert_eq!(filter.should.len(), 1);

        assert!(QdrantVectorStore::build_filter(None, None).is_none());
    }
}
