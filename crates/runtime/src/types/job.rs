//! Job records, the processing state machine, and per-job metrics

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DocumentId, JobId, TraceId};
use crate::types::error::ErrorKind;

/// Lifecycle states of an ingestion job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    // Queue states
    Queued,
    Scheduled,
    Deferred,

    // Processing states
    Started,
    Uploading,
    Extracting,
    Ocr,
    Chunking,
    Embedding,
    Storing,

    // Final states
    Indexed,
    Canceled,
    DeadLetter,

    // Failure states (retryable unless the policy says otherwise)
    FailedValidation,
    FailedUpload,
    FailedExtract,
    FailedOcr,
    FailedChunk,
    FailedEmbed,
    FailedStore,
    FailedTimeout,
    FailedCanceled,
}

impl JobState {
    /// Legal successor states. Terminal states return the empty slice.
    pub fn successors(&self) -> &'static [JobState] {
        use JobState::*;
        match self {
            Queued => &[Started, Scheduled, Canceled],
            Scheduled => &[Queued, Started, Canceled],
            Deferred => &[Queued, Canceled],
            Started => &[Uploading, FailedValidation, Canceled],
            Uploading => &[Extracting, FailedUpload, Canceled],
            Extracting => &[Ocr, Chunking, FailedExtract, Canceled],
            Ocr => &[Chunking, FailedOcr, Canceled],
            Chunking => &[Embedding, FailedChunk, Canceled],
            Embedding => &[Storing, FailedEmbed, Canceled],
            Storing => &[Indexed, FailedStore, Canceled],
            Indexed | Canceled | DeadLetter => &[],
            FailedValidation | FailedUpload | FailedExtract | FailedOcr | FailedChunk
            | FailedEmbed | FailedStore | FailedTimeout | FailedCanceled => &[Queued, DeadLetter],
        }
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Indexed | JobState::Canceled | JobState::DeadLetter)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            JobState::FailedValidation
                | JobState::FailedUpload
                | JobState::FailedExtract
                | JobState::FailedOcr
                | JobState::FailedChunk
                | JobState::FailedEmbed
                | JobState::FailedStore
                | JobState::FailedTimeout
                | JobState::FailedCanceled
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobState::Started
                | JobState::Uploading
                | JobState::Extracting
                | JobState::Ocr
                | JobState::Chunking
                | JobState::Embedding
                | JobState::Storing
        )
    }

    /// Progress percentage reported for this state. Failure states have no
    /// intrinsic value; progress is frozen at the last running-state value.
    pub fn progress_pct(&self) -> Option<f32> {
        use JobState::*;
        match self {
            Queued | Scheduled | Deferred => Some(0.0),
            Started => Some(5.0),
            Uploading => Some(10.0),
            Extracting => Some(25.0),
            Ocr => Some(40.0),
            Chunking => Some(55.0),
            Embedding => Some(75.0),
            Storing => Some(90.0),
            Indexed => Some(100.0),
            Canceled | DeadLetter => None,
            _ => None,
        }
    }

    /// Failure state for the running stage that produced an error.
    pub fn failure_state(&self) -> Option<JobState> {
        use JobState::*;
        match self {
            Started => Some(FailedValidation),
            Uploading => Some(FailedUpload),
            Extracting => Some(FailedExtract),
            Ocr => Some(FailedOcr),
            Chunking => Some(FailedChunk),
            Embedding => Some(FailedEmbed),
            Storing => Some(FailedStore),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use JobState::*;
        match self {
            Queued => "queued",
            Scheduled => "scheduled",
            Deferred => "deferred",
            Started => "started",
            Uploading => "uploading",
            Extracting => "extracting",
            Ocr => "ocr",
            Chunking => "chunking",
            Embedding => "embedding",
            Storing => "storing",
            Indexed => "indexed",
            Canceled => "canceled",
            DeadLetter => "dead_letter",
            FailedValidation => "failed_validation",
            FailedUpload => "failed_upload",
            FailedExtract => "failed_extract",
            FailedOcr => "failed_ocr",
            FailedChunk => "failed_chunk",
            FailedEmbed => "failed_embed",
            FailedStore => "failed_store",
            FailedTimeout => "failed_timeout",
            FailedCanceled => "failed_canceled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who requested a cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelKind {
    User,
    System,
}

impl CancelKind {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            CancelKind::User => ErrorKind::UserCanceled,
            CancelKind::System => ErrorKind::SystemCanceled,
        }
    }
}

/// Parameters describing one ingestion request; carried in the queue payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub ingest_id: String,
    pub project_id: String,
    pub file_id: String,
    pub document_id: DocumentId,
    pub declared_content_type: Option<String>,
    pub sha256: Option<String>,
    pub embed_version: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub force_ocr: bool,
    pub attempt: u32,
    pub max_retries: u32,
    pub trace_id: TraceId,
    pub created_at: DateTime<Utc>,
}

impl JobPayload {
    pub fn new(ingest_id: impl Into<String>, project_id: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            ingest_id: ingest_id.into(),
            project_id: project_id.into(),
            file_id: file_id.into(),
            document_id: DocumentId::new(),
            declared_content_type: None,
            sha256: None,
            embed_version: "v1.0".to_string(),
            chunk_size: 1024,
            chunk_overlap: 128,
            force_ocr: false,
            attempt: 1,
            max_retries: 4,
            trace_id: TraceId::new(),
            created_at: Utc::now(),
        }
    }

    /// Payload for the next attempt in a retry chain.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt = self.attempt + 1;
        next.created_at = Utc::now();
        next
    }
}

/// Timing, volume, quality, and cost metrics gathered while processing a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetrics {
    // Timing (seconds)
    pub queue_wait_seconds: f64,
    pub processing_seconds: f64,
    pub upload_seconds: f64,
    pub extraction_seconds: f64,
    pub ocr_seconds: f64,
    pub chunking_seconds: f64,
    pub embedding_seconds: f64,
    pub storage_seconds: f64,

    // Content
    pub file_size_bytes: u64,
    pub extracted_text_length: usize,
    pub chunks_created: usize,
    pub chunks_embedded: usize,
    pub chunks_stored: usize,

    // Quality
    pub ocr_confidence: f32,
    pub extraction_method: String,
    pub embedding_model: String,
    pub avg_chunk_size: usize,

    // Cost
    pub embedding_tokens_used: u64,
    pub estimated_cost_usd: f64,
}

/// Structured error capture on a failed job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
    pub backtrace: Option<String>,
}

/// Persistent record of one ingestion attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub ingest_id: String,
    pub project_id: String,
    pub document_id: DocumentId,

    pub state: JobState,
    pub current_step: String,
    pub progress_pct: f32,

    pub file_id: String,
    pub file_sha256: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_type: Option<String>,

    pub embed_version: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub force_ocr: bool,

    pub attempt: u32,
    pub max_retries: u32,

    pub error: Option<JobError>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,

    pub metrics: Option<JobMetrics>,
    pub metadata: HashMap<String, Value>,

    pub trace_id: TraceId,
    pub parent_job_id: Option<JobId>,
}

impl JobRecord {
    pub fn from_payload(payload: &JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            ingest_id: payload.ingest_id.clone(),
            project_id: payload.project_id.clone(),
            document_id: payload.document_id,
            state: JobState::Queued,
            current_step: JobState::Queued.as_str().to_string(),
            progress_pct: 0.0,
            file_id: payload.file_id.clone(),
            file_sha256: payload.sha256.clone(),
            file_name: None,
            file_size: None,
            file_type: payload.declared_content_type.clone(),
            embed_version: payload.embed_version.clone(),
            chunk_size: payload.chunk_size,
            chunk_overlap: payload.chunk_overlap,
            force_ocr: payload.force_ocr,
            attempt: payload.attempt,
            max_retries: payload.max_retries,
            error: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
            canceled_at: None,
            cancel_reason: None,
            metrics: None,
            metadata: HashMap::new(),
            trace_id: payload.trace_id,
            parent_job_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_successors() {
        for state in [JobState::Indexed, JobState::Canceled, JobState::DeadLetter] {
            assert!(state.successors().is_empty(), "{} must be terminal", state);
            assert!(state.is_terminal());
        }
    }

    #[test]
    fn test_running_chain_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Started));
        assert!(JobState::Started.can_transition_to(JobState::Uploading));
        assert!(JobState::Uploading.can_transition_to(JobState::Extracting));
        assert!(JobState::Extracting.can_transition_to(JobState::Ocr));
        assert!(JobState::Extracting.can_transition_to(JobState::Chunking));
        assert!(JobState::Ocr.can_transition_to(JobState::Chunking));
        assert!(JobState::Chunking.can_transition_to(JobState::Embedding));
        assert!(JobState::Embedding.can_transition_to(JobState::Storing));
        assert!(JobState::Storing.can_transition_to(JobState::Indexed));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(!JobState::Queued.can_transition_to(JobState::Embedding));
        assert!(!JobState::Embedding.can_transition_to(JobState::Extracting));
        assert!(!JobState::Indexed.can_transition_to(JobState::Queued));
        assert!(!JobState::Ocr.can_transition_to(JobState::Storing));
    }

    #[test]
    fn test_failure_states_retry_or_dead_letter() {
        assert_eq!(
            JobState::FailedEmbed.successors(),
            &[JobState::Queued, JobState::DeadLetter]
        );
        assert!(JobState::FailedEmbed.is_failure());
        assert!(!JobState::FailedEmbed.is_terminal());
    }

    #[test]
    fn test_progress_is_monotone_over_the_happy_path() {
        let path = [
            JobState::Queued,
            JobState::Started,
            JobState::Uploading,
            JobState::Extracting,
            JobState::Ocr,
            JobState::Chunking,
            JobState::Embedding,
            JobState::Storing,
            JobState::Indexed,
        ];
        let mut last = -1.0f32;
        for state in path {
            let pct = state.progress_pct().unwrap();
            assert!(pct >= last, "progress regressed at {}", state);
            last = pct;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_failure_states_freeze_progress() {
        assert_eq!(JobState::FailedEmbed.progress_pct(), None);
        assert_eq!(JobState::FailedValidation.progress_pct(), None);
    }

    #[test]
    fn test_stage_failure_mapping() {
        assert_eq!(JobState::Embedding.failure_state(), Some(JobState::FailedEmbed));
        assert_eq!(JobState::Storing.failure_state(), Some(JobState::FailedStore));
        assert_eq!(JobState::Queued.failure_state(), None);
    }

    #[test]
    fn test_payload_next_attempt() {
        let payload = JobPayload::new("ingest-a", "project-1", "file-1");
        let retry = payload.next_attempt();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.ingest_id, payload.ingest_id);
        assert_eq!(retry.document_id, payload.document_id);
    }

    #[test]
    fn test_state_serialization_is_stable() {
        let json = serde_json::to_string(&JobState::DeadLetter).unwrap();
        assert_eq!(json, "\"dead_letter\"");
        let json = serde_json::to_string(&JobState::FailedEmbed).unwrap();
        assert_eq!(json, "\"failed_embed\"");
    }
}
