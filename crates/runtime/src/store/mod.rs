//! Persistent job records and the indexed-document table
//!
//! The store owns every job record for its full lifetime. State changes go
//! through a compare-and-set `transition` so concurrent writers cannot move
//! a job along an illegal edge, and duplicate ingest detection considers only
//! attempts that are still live. Uniqueness is on `(ingest_id, attempt)` so a
//! retry chain stays queryable.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{
    DocumentId, JobError, JobId, JobMetrics, JobRecord, JobState,
};

/// Job store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate ingest id {ingest_id}, existing job {existing}")]
    DuplicateIngest { ingest_id: String, existing: JobId },

    #[error("job not found: {job_id}")]
    NotFound { job_id: JobId },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error("state conflict: expected {expected}, found {actual}")]
    StateConflict { expected: JobState, actual: JobState },

    #[error("storage backend error: {reason}")]
    Backend { reason: String },
}

/// Optional field updates applied atomically with a state transition
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub error: Option<JobError>,
    pub metrics: Option<JobMetrics>,
    pub cancel_reason: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_type: Option<String>,
    pub file_sha256: Option<String>,
}

/// Row describing an indexed document, upserted when a job finalizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub project_id: String,
    pub file_id: String,
    pub name: Option<String>,
    pub sha256: String,
    pub file_size: Option<u64>,
    pub file_type: Option<String>,
    pub chunk_count: usize,
    pub embed_version: String,
    pub uploaded_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
}

/// Transactional record store for jobs and documents
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `DuplicateIngest` when another attempt
    /// for the same ingest id is still live (neither terminal nor failed).
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Compare-and-set state transition. Rejects moves not in the legal set
    /// and stamps timestamps, step label, and frozen-on-failure progress.
    async fn transition(
        &self,
        job_id: JobId,
        from: JobState,
        to: JobState,
        update: TransitionUpdate,
    ) -> Result<JobRecord, StoreError>;

    async fn load(&self, job_id: JobId) -> Result<JobRecord, StoreError>;

    /// Latest attempt for an ingest id.
    async fn load_by_ingest(&self, ingest_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// All attempts for an ingest id, oldest first.
    async fn retry_chain(&self, ingest_id: &str) -> Result<Vec<JobRecord>, StoreError>;

    /// Jobs in a queueing or running state.
    async fn count_active(&self) -> Result<usize, StoreError>;

    /// Jobs currently in a running state.
    async fn count_processing(&self) -> Result<usize, StoreError>;

    /// Jobs sitting in a failure state awaiting a retry or dead-letter
    /// decision.
    async fn list_dlq_candidates(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Delete terminal jobs that ended before `cutoff`. Returns the number
    /// of records removed.
    async fn age_out(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn upsert_document(&self, document: DocumentRecord) -> Result<(), StoreError>;

    async fn get_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError>;

    /// Documents of a project, optionally excluding ones already at the
    /// given embed version.
    async fn list_documents(
        &self,
        project_id: &str,
        exclude_embed_version: Option<&str>,
    ) -> Result<Vec<DocumentRecord>, StoreError>;
}

/// In-process job store
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    by_ingest: RwLock<HashMap<String, Vec<JobId>>>,
    documents: RwLock<HashMap<DocumentId, DocumentRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            by_ingest: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let mut by_ingest = self.by_ingest.write();

        if let Some(chain) = by_ingest.get(&record.ingest_id) {
            // (ingest_id, attempt) must be unique, and only one attempt may
            // be live at a time.
            for existing_id in chain {
                if let Some(existing) = jobs.get(existing_id) {
                    if existing.attempt == record.attempt
                        || (!existing.state.is_terminal() && !existing.state.is_failure())
                    {
                        return Err(StoreError::DuplicateIngest {
                            ingest_id: record.ingest_id.clone(),
                            existing: *existing_id,
                        });
                    }
                }
            }
        }

        by_ingest
            .entry(record.ingest_id.clone())
            .or_default()
            .push(record.id);
        tracing::info!(
            "Inserted job {} (ingest {}, attempt {})",
            record.id,
            record.ingest_id,
            record.attempt
        );
        jobs.insert(record.id, record);
        Ok(())
    }

    async fn transition(
        &self,
        job_id: JobId,
        from: JobState,
        to: JobState,
        update: TransitionUpdate,
    ) -> Result<JobRecord, StoreError> {
        if !from.can_transition_to(to) {
            tracing::warn!("Rejected illegal transition {} -> {} for job {}", from, to, job_id);
            return Err(StoreError::IllegalTransition { from, to });
        }

        let mut jobs = self.jobs.write();
        let record = jobs.get_mut(&job_id).ok_or(StoreError::NotFound { job_id })?;

        if record.state != from {
            return Err(StoreError::StateConflict {
                expected: from,
                actual: record.state,
            });
        }

        let now = Utc::now();
        record.state = to;
        record.current_step = to.as_str().to_string();
        record.updated_at = now;

        // Failure states freeze progress at the last running-state value.
        if let Some(pct) = to.progress_pct() {
            record.progress_pct = pct;
        }

        if to == JobState::Started && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if to.is_terminal() || to.is_failure() {
            record.ended_at = Some(now);
        }
        if to == JobState::Canceled {
            record.canceled_at = Some(now);
        }

        if let Some(error) = update.error {
            record.error = Some(error);
        }
        if let Some(metrics) = update.metrics {
            record.metrics = Some(metrics);
        }
        if let Some(reason) = update.cancel_reason {
            record.cancel_reason = Some(reason);
        }
        if let Some(name) = update.file_name {
            record.file_name = Some(name);
        }
        if let Some(size) = update.file_size {
            record.file_size = Some(size);
        }
        if let Some(file_type) = update.file_type {
            record.file_type = Some(file_type);
        }
        if let Some(sha256) = update.file_sha256 {
            record.file_sha256 = Some(sha256);
        }

        tracing::info!("Job {} transitioned {} -> {}", job_id, from, to);
        Ok(record.clone())
    }

    async fn load(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound { job_id })
    }

    async fn load_by_ingest(&self, ingest_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.jobs.read();
        let by_ingest = self.by_ingest.read();
        Ok(by_ingest.get(ingest_id).and_then(|chain| {
            chain
                .iter()
                .filter_map(|id| jobs.get(id))
                .max_by_key(|record| record.attempt)
                .cloned()
        }))
    }

    async fn retry_chain(&self, ingest_id: &str) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read();
        let by_ingest = self.by_ingest.read();
        let mut chain: Vec<JobRecord> = by_ingest
            .get(ingest_id)
            .map(|ids| ids.iter().filter_map(|id| jobs.get(id)).cloned().collect())
            .unwrap_or_default();
        chain.sort_by_key(|record| record.attempt);
        Ok(chain)
    }

    async fn count_active(&self) -> Result<usize, StoreError> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|record| !record.state.is_terminal() && !record.state.is_failure())
            .count())
    }

    async fn count_processing(&self) -> Result<usize, StoreError> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|record| record.state.is_running())
            .count())
    }

    async fn list_dlq_candidates(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|record| record.state.is_failure())
            .cloned()
            .collect())
    }

    async fn age_out(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write();
        let mut by_ingest = self.by_ingest.write();
        let before = jobs.len();
        jobs.retain(|_, record| {
            !(record.state.is_terminal()
                && matches!(record.ended_at, Some(ended) if ended < cutoff))
        });
        let removed = before - jobs.len();
        if removed > 0 {
            by_ingest.retain(|_, chain| {
                chain.retain(|id| jobs.contains_key(id));
                !chain.is_empty()
            });
            tracing::info!("Aged out {} terminal job records", removed);
        }
        Ok(removed)
    }

    async fn upsert_document(&self, document: DocumentRecord) -> Result<(), StoreError> {
        self.documents.write().insert(document.id, document);
        Ok(())
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.documents.read().get(&id).cloned())
    }

    async fn list_documents(
        &self,
        project_id: &str,
        exclude_embed_version: Option<&str>,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        Ok(self
            .documents
            .read()
            .values()
            .filter(|doc| doc.project_id == project_id)
            .filter(|doc| exclude_embed_version != Some(doc.embed_version.as_str()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobPayload;

    fn record(ingest: &str) -> JobRecord {
        JobRecord::from_payload(&JobPayload::new(ingest, "project-1", "file-1"))
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let store = InMemoryJobStore::new();
        let job = record("a");
        let id = job.id;
        store.insert(job).await.unwrap();

        let loaded = store.load(id).await.unwrap();
        assert_eq!(loaded.state, JobState::Queued);
        assert_eq!(loaded.attempt, 1);
    }

    #[tokio::test]
    async fn test_duplicate_ingest_rejected_while_live() {
        let store = InMemoryJobStore::new();
        let first = record("dup");
        let first_id = first.id;
        store.insert(first).await.unwrap();

        let err = store.insert(record("dup")).await.unwrap_err();
        match err {
            StoreError::DuplicateIngest { existing, .. } => assert_eq!(existing, first_id),
            other => panic!("expected DuplicateIngest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_attempt_allowed_after_failure() {
        let store = InMemoryJobStore::new();
        let first = record("retryable");
        let first_id = first.id;
        store.insert(first).await.unwrap();

        store
            .transition(first_id, JobState::Queued, JobState::Started, TransitionUpdate::default())
            .await
            .unwrap();
        store
            .transition(
                first_id,
                JobState::Started,
                JobState::FailedValidation,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();

        let mut retry = record("retryable");
        retry.attempt = 2;
        retry.parent_job_id = Some(first_id);
        store.insert(retry).await.unwrap();

        let chain = store.retry_chain("retryable").await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].attempt, 1);
        assert_eq!(chain[1].attempt, 2);
        assert_eq!(chain[1].parent_job_id, Some(first_id));
    }

    #[tokio::test]
    async fn test_same_attempt_number_rejected() {
        let store = InMemoryJobStore::new();
        let first = record("same-attempt");
        let first_id = first.id;
        store.insert(first).await.unwrap();
        store
            .transition(first_id, JobState::Queued, JobState::Started, TransitionUpdate::default())
            .await
            .unwrap();
        store
            .transition(
                first_id,
                JobState::Started,
                JobState::FailedValidation,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();

        // Failure frees the ingest id, but attempt 1 is taken forever.
        assert!(store.insert(record("same-attempt")).await.is_err());
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let store = InMemoryJobStore::new();
        let job = record("illegal");
        let id = job.id;
        store.insert(job).await.unwrap();

        let err = store
            .transition(id, JobState::Queued, JobState::Embedding, TransitionUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        // Record untouched
        assert_eq!(store.load(id).await.unwrap().state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_cas_detects_stale_from_state() {
        let store = InMemoryJobStore::new();
        let job = record("stale");
        let id = job.id;
        store.insert(job).await.unwrap();
        store
            .transition(id, JobState::Queued, JobState::Started, TransitionUpdate::default())
            .await
            .unwrap();

        let err = store
            .transition(id, JobState::Queued, JobState::Started, TransitionUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_failure_freezes_progress() {
        let store = InMemoryJobStore::new();
        let job = record("freeze");
        let id = job.id;
        store.insert(job).await.unwrap();

        for (from, to) in [
            (JobState::Queued, JobState::Started),
            (JobState::Started, JobState::Uploading),
            (JobState::Uploading, JobState::Extracting),
        ] {
            store.transition(id, from, to, TransitionUpdate::default()).await.unwrap();
        }

        let failed = store
            .transition(
                id,
                JobState::Extracting,
                JobState::FailedExtract,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();
        assert_eq!(failed.progress_pct, 25.0);
        assert!(failed.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_dlq_candidates_and_age_out() {
        let store = InMemoryJobStore::new();

        let failed = record("failed");
        let failed_id = failed.id;
        store.insert(failed).await.unwrap();
        store
            .transition(failed_id, JobState::Queued, JobState::Started, TransitionUpdate::default())
            .await
            .unwrap();
        store
            .transition(
                failed_id,
                JobState::Started,
                JobState::FailedValidation,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();

        let candidates = store.list_dlq_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, failed_id);

        // Promote to dead letter, backdate, then age out
        store
            .transition(
                failed_id,
                JobState::FailedValidation,
                JobState::DeadLetter,
                TransitionUpdate::default(),
            )
            .await
            .unwrap();
        {
            let mut jobs = store.jobs.write();
            jobs.get_mut(&failed_id).unwrap().ended_at =
                Some(Utc::now() - chrono::Duration::days(120));
        }

        let removed = store.age_out(Utc::now() - chrono::Duration::days(90)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(failed_id).await.is_err());
        assert!(store.retry_chain("failed").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_document_version_filtering() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for version in ["v1.0", "v1.0", "v1.0", "v2.0", "v2.0"] {
            store
                .upsert_document(DocumentRecord {
                    id: DocumentId::new(),
                    project_id: "project-1".to_string(),
                    file_id: "file".to_string(),
                    name: None,
                    sha256: "00".to_string(),
                    file_size: None,
                    file_type: None,
                    chunk_count: 1,
                    embed_version: version.to_string(),
                    uploaded_at: now,
                    indexed_at: now,
                })
                .await
                .unwrap();
        }

        let stale = store.list_documents("project-1", Some("v2.0")).await.unwrap();
        assert_eq!(stale.len(), 3);
        let all = store.list_documents("project-1", None).await.unwrap();
        assert_eq!(all.len(), 5);
    }
}
