//! Request and response types for the HTTP API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{JobId, JobState};

/// Standard error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorResponse {
    pub fn new(code: &str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.to_string(),
            details: None,
        }
    }
}

/// Body of an ingest submission
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub project_id: String,
    pub file_id: String,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    #[serde(default)]
    pub force_ocr: bool,
}

/// Accepted ingest response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub job_id: JobId,
    pub ingest_id: String,
    pub queue_position: usize,
    pub estimated_start_time: Option<DateTime<Utc>>,
}

/// 409 body for duplicate ingest ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateIngestResponse {
    pub code: String,
    pub job_id: JobId,
    pub ingest_id: String,
}

/// Job status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub ingest_id: String,
    pub state: JobState,
    pub progress_pct: f32,
    pub current_step: String,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub estimated_remaining_seconds: Option<u64>,

    pub document_id: Option<String>,
    pub chunks_indexed: Option<usize>,

    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,

    pub queue_position: Option<usize>,
}

/// Cancel query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct CancelParams {
    pub reason: Option<String>,
}

/// Cancel response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Retry query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct RetryParams {
    pub max_retries: Option<u32>,
    pub delay_seconds: Option<u64>,
}

/// Reindex request body
#[derive(Debug, Clone, Deserialize)]
pub struct ReindexRequest {
    pub project_id: String,
    pub new_embed_version: Option<String>,
    #[serde(default = "default_reindex_batch")]
    pub batch_size: usize,
    #[serde(default)]
    pub force_reindex: bool,
}

fn default_reindex_batch() -> usize {
    10
}

/// Reindex response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexResponse {
    pub reindex_job_id: String,
    pub documents_to_reindex: usize,
    pub old_embed_version: Option<String>,
    pub new_embed_version: String,
    pub estimated_duration_minutes: u64,
    pub batch_size: usize,
}

/// DLQ listing query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct DlqListParams {
    pub limit: Option<usize>,
    pub error_type_filter: Option<String>,
}

/// DLQ resolution body
#[derive(Debug, Clone, Deserialize)]
pub struct DlqResolveRequest {
    pub notes: String,
    pub resolved_by: String,
}

/// DLQ report query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct DlqReportParams {
    pub days: Option<i64>,
}

/// Queue statistics response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub queue_length: usize,
    pub dlq_length: usize,
    pub processing_jobs: usize,
    pub active_workers: usize,
    pub total_workers: usize,
    pub embedding_rate_current: u64,
    pub embedding_rate_limit: u64,
    pub embed_version: String,
    pub queue_health: String,
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub queue_ok: bool,
    pub store_ok: bool,
    pub vector_store_ok: bool,
    pub embedder_ok: bool,
}
