//! ingestd runtime
//!
//! Durable document ingestion for a retrieval-augmented generation index:
//! a queue-backed worker pipeline with a strict job state machine, typed
//! retry policies, a dead-letter queue with analysis, cooperative
//! cancellation, embedding rate limits, file security validation, and a
//! query-side retriever and context builder over the vector store.

pub mod api;
pub mod config;
pub mod dlq;
pub mod limit;
pub mod pipeline;
pub mod queue;
pub mod retrieval;
pub mod security;
pub mod store;
pub mod types;
pub mod vector;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::RuntimeConfig;
use crate::dlq::{DlqHandler, DlqStore, InMemoryDlqStore, LogAlertSink};
use crate::limit::{CancelRegistry, EmbeddingPool, EmbeddingRateLimiter, RateLimitUsage};
use crate::pipeline::stages::EmbeddingModel;
use crate::pipeline::{PipelineCollaborators, PipelineExecutor};
use crate::queue::{EnqueueOptions, InMemoryQueue, QueueDriver};
use crate::retrieval::{ContextBuilder, DocumentRetriever};
use crate::security::ResourceGuard;
use crate::store::{InMemoryJobStore, JobStore, StoreError};
use crate::types::{
    CancelKind, DocumentId, JobId, JobPayload, JobRecord, JobState, Priority, TraceId,
};
use crate::vector::VectorStore;

/// Runtime-level errors surfaced to the API layer
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("duplicate ingest id {ingest_id}")]
    DuplicateIngest { ingest_id: String, job_id: JobId },

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    #[error("job {job_id} is not in a retryable state ({state})")]
    NotRetryable { job_id: JobId, state: JobState },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("dead letter queue error: {0}")]
    Dlq(#[from] crate::dlq::DlqError),
}

/// Parameters of one ingest submission
#[derive(Debug, Clone)]
pub struct IngestSubmission {
    pub ingest_id: String,
    pub project_id: String,
    pub file_id: String,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub force_ocr: bool,
    pub priority: Priority,
}

/// Accepted submission details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub job_id: JobId,
    pub ingest_id: String,
    pub queue_position: usize,
    pub estimated_start_time: Option<DateTime<Utc>>,
}

/// Result of a manual retry request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryReceipt {
    pub retry_job_id: Option<JobId>,
    pub retry_count: u32,
    pub delay_seconds: u64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_to_dlq: bool,
    pub dlq_entry: Option<crate::dlq::DlqEntry>,
}

/// Live view of one job for the status API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub record: JobRecord,
    pub queue_position: Option<usize>,
    pub estimated_remaining_seconds: Option<u64>,
    pub chunks_indexed: Option<usize>,
}

/// Queue statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_length: usize,
    pub dlq_length: usize,
    pub processing_jobs: usize,
    pub active_workers: usize,
    pub total_workers: usize,
    pub embedding_rate: RateLimitUsage,
    pub embed_version: String,
    pub queue_health: String,
}

/// Readiness of the runtime's dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub queue_ok: bool,
    pub store_ok: bool,
    pub vector_store_ok: bool,
    pub embedder_ok: bool,
}

/// The assembled ingestion runtime
///
/// One instance is constructed at startup and shared behind `Arc`; components
/// are reached through it rather than through globals.
pub struct IngestRuntime {
    pub config: RuntimeConfig,
    queue: Arc<InMemoryQueue>,
    store: Arc<dyn JobStore>,
    vector_store: Arc<dyn VectorStore>,
    dlq: Arc<DlqHandler>,
    dlq_store: Arc<dyn DlqStore>,
    cancels: Arc<CancelRegistry>,
    rate_limiter: Arc<EmbeddingRateLimiter>,
    embedder: Arc<dyn EmbeddingModel>,
    retriever: Arc<DocumentRetriever>,
    context_builder: Arc<ContextBuilder>,
    executor: Arc<PipelineExecutor>,
    shutdown: Arc<Notify>,
    workers_started: AtomicUsize,
}

impl IngestRuntime {
    pub fn new(
        config: RuntimeConfig,
        collaborators: PipelineCollaborators,
        vector_store: Arc<dyn VectorStore>,
    ) -> Arc<Self> {
        let queue = InMemoryQueue::new(config.queue.clone());
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let dlq_store: Arc<dyn DlqStore> = Arc::new(InMemoryDlqStore::new());
        let dlq = Arc::new(DlqHandler::new(
            dlq_store.clone(),
            Arc::new(LogAlertSink),
            config.dlq.clone(),
        ));
        let cancels = Arc::new(CancelRegistry::new());
        let rate_limiter = Arc::new(EmbeddingRateLimiter::new(config.rate_limit.clone()));
        let embedding_pool = Arc::new(EmbeddingPool::new(config.rate_limit.embedding_concurrency));
        let shutdown = Arc::new(Notify::new());

        let embedder = collaborators.embedder.clone();
        let retriever = Arc::new(DocumentRetriever::new(vector_store.clone(), embedder.clone()));
        let context_builder = Arc::new(ContextBuilder::new());

        let executor = Arc::new(PipelineExecutor::new(
            store.clone(),
            queue.clone(),
            vector_store.clone(),
            dlq.clone(),
            cancels.clone(),
            rate_limiter.clone(),
            embedding_pool,
            config.security.clone(),
            ResourceGuard::new(config.resources.clone()),
            collaborators,
            config.worker.clone(),
            config.queue.clone(),
        ));

        let _cleanup = dlq::start_cleanup_task(dlq_store.clone(), config.dlq.clone(), shutdown.clone());

        Arc::new(Self {
            config,
            queue,
            store,
            vector_store,
            dlq,
            dlq_store,
            cancels,
            rate_limiter,
            embedder,
            retriever,
            context_builder,
            executor,
            shutdown,
            workers_started: AtomicUsize::new(0),
        })
    }

    /// Spawn `count` worker loops.
    pub fn start_workers(self: &Arc<Self>, count: usize) {
        for index in 0..count {
            let executor = self.executor.clone();
            let shutdown = self.shutdown.clone();
            let worker_id = format!("worker-{}", index);
            tokio::spawn(executor.run_worker(worker_id, shutdown));
        }
        self.workers_started.fetch_add(count, Ordering::Relaxed);
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn vector_store(&self) -> Arc<dyn VectorStore> {
        self.vector_store.clone()
    }

    pub fn retriever(&self) -> Arc<DocumentRetriever> {
        self.retriever.clone()
    }

    pub fn context_builder(&self) -> Arc<ContextBuilder> {
        self.context_builder.clone()
    }

    pub fn dlq(&self) -> Arc<DlqHandler> {
        self.dlq.clone()
    }

    pub fn executor(&self) -> Arc<PipelineExecutor> {
        self.executor.clone()
    }

    /// Accept an ingest request: insert the job record (idempotency gate),
    /// then enqueue it. Returns the existing job on a duplicate ingest id.
    pub async fn submit_ingest(
        &self,
        submission: IngestSubmission,
    ) -> Result<SubmissionReceipt, RuntimeError> {
        let mut payload = JobPayload::new(
            submission.ingest_id.clone(),
            submission.project_id,
            submission.file_id,
        );
        payload.embed_version = self.config.worker.embed_version.clone();
        payload.max_retries = self.config.worker.max_retries;
        payload.force_ocr = submission.force_ocr;
        if let Some(chunk_size) = submission.chunk_size {
            payload.chunk_size = chunk_size;
        }
        if let Some(chunk_overlap) = submission.chunk_overlap {
            payload.chunk_overlap = chunk_overlap;
        }

        let record = JobRecord::from_payload(&payload);
        let job_id = record.id;
        match self.store.insert(record).await {
            Ok(()) => {}
            Err(StoreError::DuplicateIngest { ingest_id, existing }) => {
                return Err(RuntimeError::DuplicateIngest {
                    ingest_id,
                    job_id: existing,
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.queue
            .enqueue(
                job_id,
                payload,
                EnqueueOptions {
                    priority: submission.priority,
                    delay: None,
                },
            )
            .await?;

        let queue_position = self.queue.position(job_id).await?;
        Ok(SubmissionReceipt {
            job_id,
            ingest_id: submission.ingest_id,
            queue_position,
            estimated_start_time: self.estimate_start_time(queue_position),
        })
    }

    /// Rough start estimate from queue depth and worker count.
    fn estimate_start_time(&self, queue_position: usize) -> Option<DateTime<Utc>> {
        let workers = self.workers_started.load(Ordering::Relaxed);
        if workers == 0 {
            return None;
        }
        let minutes = (queue_position as i64 * 5) / workers as i64;
        Some(Utc::now() + ChronoDuration::minutes(minutes))
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatusView, RuntimeError> {
        let record = self
            .store
            .load(job_id)
            .await
            .map_err(|_| RuntimeError::JobNotFound { job_id })?;

        let queue_position = match record.state {
            JobState::Queued | JobState::Scheduled | JobState::Deferred => {
                Some(self.queue.position(job_id).await?)
            }
            _ => None,
        };

        // Remaining time from elapsed processing and reported progress
        let estimated_remaining_seconds = match (record.started_at, record.progress_pct) {
            (Some(started), pct) if pct > 0.0 && pct < 100.0 && !record.state.is_terminal() => {
                let elapsed = (Utc::now() - started).num_seconds().max(0) as f64;
                let total = elapsed / (f64::from(pct) / 100.0);
                Some((total - elapsed).max(0.0) as u64)
            }
            _ => None,
        };

        let chunks_indexed = record.metrics.as_ref().map(|m| m.chunks_stored);
        Ok(JobStatusView {
            record,
            queue_position,
            estimated_remaining_seconds,
            chunks_indexed,
        })
    }

    /// Request cancellation. Queued jobs are canceled immediately; running
    /// jobs stop at their next checkpoint.
    pub async fn cancel_job(
        &self,
        job_id: JobId,
        kind: CancelKind,
        reason: &str,
    ) -> Result<bool, RuntimeError> {
        let record = self
            .store
            .load(job_id)
            .await
            .map_err(|_| RuntimeError::JobNotFound { job_id })?;

        if record.state.is_terminal() {
            return Ok(false);
        }

        self.cancels.request_cancel(job_id, kind, reason);

        // A job still waiting in the queue can be finished off right here.
        if matches!(record.state, JobState::Queued | JobState::Scheduled | JobState::Deferred)
            && self.queue.cancel_queued(job_id).await?
        {
            self.store
                .transition(
                    job_id,
                    record.state,
                    JobState::Canceled,
                    crate::store::TransitionUpdate {
                        cancel_reason: Some(reason.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            self.cancels.clear(job_id);
        }
        Ok(true)
    }

    /// Manual retry of a failed job. Exhausted budgets promote the job to
    /// the dead-letter queue instead.
    pub async fn retry_job(
        &self,
        job_id: JobId,
        max_retries: Option<u32>,
        delay_seconds: Option<u64>,
    ) -> Result<RetryReceipt, RuntimeError> {
        let record = self
            .store
            .load(job_id)
            .await
            .map_err(|_| RuntimeError::JobNotFound { job_id })?;

        if !record.state.is_failure() {
            return Err(RuntimeError::NotRetryable {
                job_id,
                state: record.state,
            });
        }

        let budget = max_retries.unwrap_or(record.max_retries);
        if record.attempt > budget {
            let kind = record
                .error
                .as_ref()
                .map(|e| e.kind)
                .unwrap_or(crate::types::ErrorKind::Unknown);
            let message = record
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| format!("max retries ({}) exceeded", budget));
            self.executor.promote_to_dlq(&record, kind, &message).await?;
            let entry = self.dlq_store.get(job_id).await.ok();
            return Ok(RetryReceipt {
                retry_job_id: None,
                retry_count: record.attempt,
                delay_seconds: 0,
                scheduled_at: None,
                sent_to_dlq: true,
                dlq_entry: entry,
            });
        }

        // Exponential fallback when the caller does not pin a delay
        let delay = delay_seconds
            .unwrap_or_else(|| 5u64.saturating_pow(record.attempt.saturating_sub(1).min(8)).min(125));
        let retry_job_id = self.executor.spawn_retry(&record, delay).await?;
        Ok(RetryReceipt {
            retry_job_id: Some(retry_job_id),
            retry_count: record.attempt + 1,
            delay_seconds: delay,
            scheduled_at: Some(Utc::now() + ChronoDuration::seconds(delay as i64)),
            sent_to_dlq: false,
            dlq_entry: None,
        })
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, RuntimeError> {
        let queue_length = self.queue.len().await?;
        let processing_jobs = self.store.count_processing().await?;
        let dlq_length = self.dlq_store.open_count().await?;
        let total_workers = self.workers_started.load(Ordering::Relaxed);

        let queue_health = if total_workers > 0 && queue_length < 1000 {
            "healthy"
        } else {
            "degraded"
        };

        Ok(QueueStats {
            queue_length,
            dlq_length,
            processing_jobs,
            active_workers: processing_jobs.min(total_workers),
            total_workers,
            embedding_rate: self.rate_limiter.usage(),
            embed_version: self.config.worker.embed_version.clone(),
            queue_health: queue_health.to_string(),
        })
    }

    pub async fn readiness(&self) -> Readiness {
        let queue_ok = self.queue.len().await.is_ok();
        let store_ok = self.store.count_active().await.is_ok();
        let vector_store_ok = self.vector_store.healthy().await;
        let embedder_ok = self.embedder.healthy().await;
        Readiness {
            ready: queue_ok && store_ok && vector_store_ok && embedder_ok,
            queue_ok,
            store_ok,
            vector_store_ok,
            embedder_ok,
        }
    }

    /// Stop workers and background tasks.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down ingestion runtime");
        self.shutdown.notify_waiters();
        self.queue.shutdown();
    }

    /// Deterministic reindex ingest id, exposed for API handlers.
    pub fn reindex_ingest_id(document_id: &DocumentId, version: &str) -> String {
        crate::types::reindex_ingest_id(document_id, version)
    }

    /// Trace id helper for request logging.
    pub fn new_trace_id() -> TraceId {
        TraceId::new()
    }
}
