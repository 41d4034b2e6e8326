//! Vector store adapter
//!
//! Stores chunk embeddings keyed by `(document_id, chunk index)` and serves
//! filtered similarity search for the retriever. Backends implement the
//! `VectorStore` trait; an in-process implementation backs tests and the
//! Qdrant implementation backs deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DocumentId, ErrorKind};

pub mod qdrant;

pub use qdrant::QdrantVectorStore;

/// Vector store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorStoreError {
    #[error("vector store connection error: {reason}")]
    Connection { reason: String },

    #[error("vector store write error: {reason}")]
    Write { reason: String },

    #[error("invalid vector operation: {reason}")]
    InvalidOperation { reason: String },
}

impl VectorStoreError {
    /// The pipeline error this store failure maps to.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            VectorStoreError::Connection { .. } => ErrorKind::VectorStoreConnection,
            VectorStoreError::Write { .. } | VectorStoreError::InvalidOperation { .. } => {
                ErrorKind::VectorStoreWrite
            }
        }
    }
}

/// One stored chunk with its embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    /// `<document_id>:<chunk index>`
    pub id: String,
    pub document_id: DocumentId,
    pub project_id: String,
    pub embed_version: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, Value>,
}

impl VectorRecord {
    pub fn chunk_id(document_id: &DocumentId, index: usize) -> String {
        format!("{}:{}", document_id, index)
    }
}

/// Conjunction of metadata equality conditions
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub equals: Vec<(String, Value)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.equals.push((key.to_string(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    fn matches(&self, record: &VectorRecord) -> bool {
        self.equals.iter().all(|(key, expected)| match key.as_str() {
            "project_id" => Value::String(record.project_id.clone()) == *expected,
            "document_id" => Value::String(record.document_id.to_string()) == *expected,
            "embed_version" => Value::String(record.embed_version.clone()) == *expected,
            _ => record.metadata.get(key) == Some(expected),
        })
    }
}

/// Disjunction of substring conditions over chunk text
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub contains_any: Vec<String>,
}

impl DocumentFilter {
    pub fn contains_any(terms: Vec<String>) -> Self {
        Self { contains_any: terms }
    }

    fn matches(&self, text: &str) -> bool {
        if self.contains_any.is_empty() {
            return true;
        }
        let lowered = text.to_lowercase();
        self.contains_any.iter().any(|term| lowered.contains(&term.to_lowercase()))
    }
}

/// One similarity search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub document_id: DocumentId,
    pub text: String,
    pub metadata: HashMap<String, Value>,
    /// Cosine distance in `[0, 2]`
    pub distance: f32,
}

impl SearchHit {
    /// Map distance into a `[0, 1]` similarity score.
    pub fn similarity(&self) -> f32 {
        (1.0 - self.distance / 2.0).clamp(0.0, 1.0)
    }
}

/// Vector store operations
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert records; existing ids are overwritten. Returns stored ids.
    async fn add(&self, records: Vec<VectorRecord>) -> Result<Vec<String>, VectorStoreError>;

    /// Nearest neighbours of `query`, filtered, ordered by ascending
    /// distance.
    async fn search(
        &self,
        query: Vec<f32>,
        n_results: usize,
        metadata_filter: Option<MetadataFilter>,
        document_filter: Option<DocumentFilter>,
    ) -> Result<Vec<SearchHit>, VectorStoreError>;

    /// Filtered scroll without similarity ordering.
    async fn get(
        &self,
        metadata_filter: Option<MetadataFilter>,
        document_filter: Option<DocumentFilter>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<VectorRecord>, VectorStoreError>;

    /// Update text and/or metadata of existing records.
    async fn update(
        &self,
        ids: Vec<String>,
        text: Option<String>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<(), VectorStoreError>;

    async fn delete(&self, ids: Vec<String>) -> Result<(), VectorStoreError>;

    async fn count(&self) -> Result<usize, VectorStoreError>;

    /// Drop every stored record.
    async fn reset(&self) -> Result<(), VectorStoreError>;

    /// Backend reachability, used by readiness checks.
    async fn healthy(&self) -> bool;
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 2.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

/// In-process vector store
pub struct InMemoryVectorStore {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, records: Vec<VectorRecord>) -> Result<Vec<String>, VectorStoreError> {
        let mut store = self.records.write();
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        for record in records {
            store.insert(record.id.clone(), record);
        }
        Ok(ids)
    }

    async fn search(
        &self,
        query: Vec<f32>,
        n_results: usize,
        metadata_filter: Option<MetadataFilter>,
        document_filter: Option<DocumentFilter>,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        let store = self.records.read();
        let mut hits: Vec<SearchHit> = store
            .values()
            .filter(|record| metadata_filter.as_ref().map_or(true, |f| f.matches(record)))
            .filter(|record| document_filter.as_ref().map_or(true, |f| f.matches(&record.text)))
            .map(|record| SearchHit {
                id: record.id.clone(),
                document_id: record.document_id,
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                distance: cosine_distance(&query, &record.embedding),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(n_results);
        Ok(hits)
    }

    async fn get(
        &self,
        metadata_filter: Option<MetadataFilter>,
        document_filter: Option<DocumentFilter>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<VectorRecord>, VectorStoreError> {
        let store = self.records.read();
        let mut records: Vec<VectorRecord> = store
            .values()
            .filter(|record| metadata_filter.as_ref().map_or(true, |f| f.matches(record)))
            .filter(|record| document_filter.as_ref().map_or(true, |f| f.matches(&record.text)))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn update(
        &self,
        ids: Vec<String>,
        text: Option<String>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<(), VectorStoreError> {
        let mut store = self.records.write();
        for id in ids {
            let record = store.get_mut(&id).ok_or_else(|| VectorStoreError::InvalidOperation {
                reason: format!("unknown record id {}", id),
            })?;
            if let Some(text) = &text {
                record.text = text.clone();
            }
            if let Some(metadata) = &metadata {
                record.metadata.extend(metadata.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, ids: Vec<String>) -> Result<(), VectorStoreError> {
        let mut store = self.records.write();
        for id in ids {
            store.remove(&id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, VectorStoreError> {
        Ok(self.records.read().len())
    }

    async fn reset(&self) -> Result<(), VectorStoreError> {
        self.records.write().clear();
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}
