//! Pipeline executor: drives one job through the ingestion state machine
//!
//! Each stage is a function returning a typed result; the driver performs the
//! compare-and-set transition *before* the next stage begins, so a persisted
//! state never overstates real progress. Failures are mapped through the
//! retry policy into either a delayed child job or a dead-letter entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;

use crate::config::{QueueConfig, SecurityConfig, WorkerConfig};
use crate::dlq::{DlqEntry, DlqHandler};
use crate::limit::{CancelRegistry, EmbeddingPool, EmbeddingRateLimiter};
use crate::queue::{EnqueueOptions, QueueDriver, QueueError};
use crate::security::{FileSecurityValidator, ResourceGuard, TempFileManager};
use crate::store::{DocumentRecord, JobStore, StoreError, TransitionUpdate};
use crate::types::{
    should_retry, ErrorKind, JobError, JobId, JobMetrics, JobPayload, JobRecord, JobState,
    Priority,
};
use crate::vector::{VectorRecord, VectorStore};

pub mod stages;

use stages::{
    estimate_tokens, extraction_method, EmbeddingModel, FileSource, OcrEngine, StageError,
    TextChunker, TextExtractor,
};

/// Text markers that suggest extraction produced garbage and OCR should run
const GARBLED_MARKERS: &[&str] = &["\u{fffd}\u{fffd}\u{fffd}\u{fffd}", "???", "\u{25a1}\u{25a1}\u{25a1}", "\u{01c2}\u{01c2}\u{01c2}"];

/// Minimum usable extracted text length
const MIN_EXTRACTED_CHARS: usize = 10;

/// Rough cost per embedding token in USD
const COST_PER_TOKEN_USD: f64 = 0.00001;

/// External collaborators the pipeline drives
pub struct PipelineCollaborators {
    pub file_source: Arc<dyn FileSource>,
    pub extractor: Arc<dyn TextExtractor>,
    pub ocr: Option<Arc<dyn OcrEngine>>,
    pub chunker: Arc<dyn TextChunker>,
    pub embedder: Arc<dyn EmbeddingModel>,
}

/// Outcome of a completed job
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub final_state: JobState,
    pub chunks_stored: usize,
    pub retry_job_id: Option<JobId>,
    pub sent_to_dlq: bool,
}

/// Summary of a reindex fan-out
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReindexReport {
    pub documents_to_reindex: usize,
    pub jobs_enqueued: usize,
    pub skipped_current: usize,
    pub skipped_duplicate: usize,
    pub old_embed_version: Option<String>,
    pub new_embed_version: String,
    pub estimated_duration_minutes: u64,
}


/// Drives dequeued jobs through upload, extract, OCR, chunk, embed, store
pub struct PipelineExecutor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn QueueDriver>,
    vector_store: Arc<dyn VectorStore>,
    dlq: Arc<DlqHandler>,
    cancels: Arc<CancelRegistry>,
    rate_limiter: Arc<EmbeddingRateLimiter>,
    embedding_pool: Arc<EmbeddingPool>,
    validator: FileSecurityValidator,
    resource_guard: ResourceGuard,
    collaborators: PipelineCollaborators,
    config: WorkerConfig,
    queue_config: QueueConfig,
}

impl PipelineExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn QueueDriver>,
        vector_store: Arc<dyn VectorStore>,
        dlq: Arc<DlqHandler>,
        cancels: Arc<CancelRegistry>,
        rate_limiter: Arc<EmbeddingRateLimiter>,
        embedding_pool: Arc<EmbeddingPool>,
        security: SecurityConfig,
        resource_guard: ResourceGuard,
        collaborators: PipelineCollaborators,
        config: WorkerConfig,
        queue_config: QueueConfig,
    ) -> Self {
        Self {
            store,
            queue,
            vector_store,
            dlq,
            cancels,
            rate_limiter,
            embedding_pool,
            validator: FileSecurityValidator::new(security),
            resource_guard,
            collaborators,
            config,
            queue_config,
        }
    }

    /// Worker loop: dequeue, process, ack. Runs until `shutdown` notifies.
    pub async fn run_worker(self: Arc<Self>, worker_id: String, shutdown: Arc<Notify>) {
        tracing::info!("Worker {} started", worker_id);
        let mut idle_backoff = Duration::from_millis(200);

        loop {
            let dequeued = tokio::select! {
                result = self.queue.dequeue(&worker_id, self.queue_config.visibility_timeout) => result,
                _ = shutdown.notified() => break,
            };

            match dequeued {
                Ok(Some((job_id, payload))) => {
                    idle_backoff = Duration::from_millis(200);
                    let outcome = tokio::select! {
                        outcome = self.process(job_id, payload) => outcome,
                        _ = shutdown.notified() => {
                            // Leave the job unacked; it will be redelivered.
                            break;
                        }
                    };
                    match outcome {
                        Ok(outcome) => {
                            tracing::info!(
                                "Worker {} finished job {} in state {}",
                                worker_id,
                                job_id,
                                outcome.final_state
                            );
                        }
                        Err(e) => {
                            tracing::error!("Worker {} failed to handle job {}: {}", worker_id, job_id, e);
                        }
                    }
                    if let Err(e) = self.queue.ack(job_id).await {
                        tracing::error!("Failed to ack job {}: {}", job_id, e);
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(idle_backoff).await;
                }
                Err(QueueError::ShuttingDown) => break,
                Err(e) => {
                    // Backend unavailable: jobs stay safe unacked, sleep with
                    // bounded backoff before retrying.
                    tracing::error!("Queue unavailable for worker {}: {}", worker_id, e);
                    tokio::time::sleep(idle_backoff).await;
                    idle_backoff = (idle_backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
        tracing::info!("Worker {} stopped", worker_id);
    }

    /// Process one dequeued job under the wall-clock timeout.
    pub async fn process(&self, job_id: JobId, payload: JobPayload) -> Result<JobOutcome, StoreError> {
        let record = self.store.load(job_id).await?;

        // A record already mid-flight means a worker died holding this job;
        // the redelivery spawns a retry attempt instead of resuming.
        if record.state.is_running() {
            tracing::warn!("Job {} redelivered in state {}; treating as lost worker", job_id, record.state);
            return self
                .fail_job(record, ErrorKind::Unknown, "worker lost during processing".to_string(), JobMetrics::default())
                .await;
        }
        if record.state != JobState::Queued && record.state != JobState::Scheduled {
            tracing::warn!("Job {} dequeued in unexpected state {}; skipping", job_id, record.state);
            return Ok(JobOutcome {
                job_id,
                final_state: record.state,
                chunks_stored: 0,
                retry_job_id: None,
                sent_to_dlq: false,
            });
        }

        match tokio::time::timeout(self.config.worker_timeout, self.run_stages(record.clone(), &payload)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!("Job {} exceeded the worker timeout", job_id);
                let current = self.store.load(job_id).await?;
                self.fail_job(
                    current,
                    ErrorKind::WorkerTimeout,
                    format!("job exceeded the {}s worker timeout", self.config.worker_timeout.as_secs()),
                    JobMetrics::default(),
                )
                .await
            }
        }
    }

    async fn run_stages(&self, record: JobRecord, payload: &JobPayload) -> Result<JobOutcome, StoreError> {
        let job_id = record.id;
        let mut metrics = JobMetrics {
            queue_wait_seconds: (Utc::now() - payload.created_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64(),
            ..JobMetrics::default()
        };

        let job_started = Instant::now();

        let temp_files = match TempFileManager::new() {
            Ok(manager) => manager,
            Err(e) => {
                let current = self.store.load(job_id).await?;
                return self.fail_job(current, ErrorKind::DiskFull, e.to_string(), metrics).await;
            }
        };

        let result = self
            .run_stages_inner(&record, payload, &mut metrics, &temp_files, job_started)
            .await;

        // Cleanup runs on every exit path, including failure and cancel.
        temp_files.cleanup_all();

        match result {
            Ok(chunks_stored) => {
                self.cancels.clear(job_id);
                Ok(JobOutcome {
                    job_id,
                    final_state: JobState::Indexed,
                    chunks_stored,
                    retry_job_id: None,
                    sent_to_dlq: false,
                })
            }
            Err(stage_error) => {
                let current = self.store.load(job_id).await?;
                self.fail_job(current, stage_error.kind, stage_error.message, metrics).await
            }
        }
    }

    async fn run_stages_inner(
        &self,
        record: &JobRecord,
        payload: &JobPayload,
        metrics: &mut JobMetrics,
        temp_files: &TempFileManager,
        job_started: Instant,
    ) -> Result<usize, StageError> {
        let job_id = record.id;

        // Stage: validate payload shape
        self.transition(job_id, record.state, JobState::Started, TransitionUpdate::default())
            .await?;
        self.checkpoint(job_id)?;
        if payload.project_id.trim().is_empty() {
            return Err(StageError::new(ErrorKind::InvalidProject, "invalid project_id"));
        }
        if payload.file_id.trim().is_empty() {
            return Err(StageError::new(ErrorKind::FileNotFound, "invalid file_id"));
        }

        // Stage: upload and security validation
        self.transition(job_id, JobState::Started, JobState::Uploading, TransitionUpdate::default())
            .await?;
        let upload_started = Instant::now();
        let file_info = self.collaborators.file_source.get_file_info(&payload.file_id).await?;
        let bytes = self.collaborators.file_source.read(&payload.file_id).await?;

        let suffix = std::path::Path::new(&file_info.name)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let local_path = temp_files
            .write_temp_file(&suffix, &bytes)
            .map_err(|e| StageError::new(ErrorKind::DiskFull, e.to_string()))?;

        let report = self
            .validator
            .validate(&local_path, file_info.content_type.as_deref());
        if !report.is_safe {
            let kind = classify_security_report(&report);
            return Err(StageError::new(kind, report.issues.join("; ")));
        }

        metrics.file_size_bytes = file_info.size;
        metrics.upload_seconds = upload_started.elapsed().as_secs_f64();
        self.set_progress_meta(job_id, 10.0, &format!("uploaded {} ({} bytes)", file_info.name, file_info.size))
            .await;

        // Stage: extract text
        self.transition(
            job_id,
            JobState::Uploading,
            JobState::Extracting,
            TransitionUpdate {
                file_name: Some(file_info.name.clone()),
                file_size: Some(file_info.size),
                file_type: file_info.content_type.clone(),
                file_sha256: report.sha256.clone(),
                ..TransitionUpdate::default()
            },
        )
        .await?;
        self.checkpoint(job_id)?;
        self.enforce_resources(job_started)?;

        let extraction_started = Instant::now();
        let mut text = self
            .with_cancel_watch(
                job_id,
                self.collaborators
                    .extractor
                    .extract(&local_path, file_info.content_type.as_deref()),
            )
            .await?;
        metrics.extraction_seconds = extraction_started.elapsed().as_secs_f64();
        metrics.extraction_method = extraction_method(file_info.content_type.as_deref()).to_string();
        metrics.extracted_text_length = text.chars().count();

        let wants_ocr = payload.force_ocr || needs_ocr(&text, self.config.ocr_text_threshold);
        if text.trim().chars().count() < MIN_EXTRACTED_CHARS && !(wants_ocr && self.collaborators.ocr.is_some()) {
            return Err(StageError::new(
                ErrorKind::ExtractionFailed,
                "no text content could be extracted from file",
            ));
        }

        // Stage: OCR, only when extraction looks unusable
        if let (true, Some(engine)) = (wants_ocr, self.collaborators.ocr.as_ref()) {
            self.transition(job_id, JobState::Extracting, JobState::Ocr, TransitionUpdate::default())
                .await?;
            self.checkpoint(job_id)?;

            let ocr_started = Instant::now();
            let output = self.with_cancel_watch(job_id, engine.recognize(&local_path)).await?;
            if output.text.trim().chars().count() < MIN_EXTRACTED_CHARS {
                return Err(StageError::new(
                    ErrorKind::OcrEngineError,
                    "OCR failed to extract readable text",
                ));
            }
            if output.confidence < self.config.ocr_confidence_warning {
                tracing::warn!("Job {}: low OCR confidence {:.2}", job_id, output.confidence);
            }
            metrics.ocr_seconds = ocr_started.elapsed().as_secs_f64();
            metrics.ocr_confidence = output.confidence;
            metrics.extracted_text_length = output.text.chars().count();
            text = output.text;

            self.transition(job_id, JobState::Ocr, JobState::Chunking, TransitionUpdate::default())
                .await?;
        } else {
            self.transition(job_id, JobState::Extracting, JobState::Chunking, TransitionUpdate::default())
                .await?;
        }
        self.checkpoint(job_id)?;
        self.enforce_resources(job_started)?;

        // Stage: chunk
        let chunking_started = Instant::now();
        let chunks = match tokio::time::timeout(
            self.config.chunk_timeout,
            self.with_cancel_watch(
                job_id,
                self.collaborators
                    .chunker
                    .chunk(&text, payload.chunk_size, payload.chunk_overlap),
            ),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(StageError::new(
                    ErrorKind::ChunkingError,
                    format!("chunking exceeded {}s timeout", self.config.chunk_timeout.as_secs()),
                ))
            }
        };
        if chunks.is_empty() {
            return Err(StageError::new(ErrorKind::ChunkingError, "failed to create text chunks"));
        }
        metrics.chunks_created = chunks.len();
        metrics.chunking_seconds = chunking_started.elapsed().as_secs_f64();
        metrics.avg_chunk_size = chunks.iter().map(|c| c.chars().count()).sum::<usize>() / chunks.len();

        // Stage: embed in batches, rate limited and cancellation checked
        self.transition(job_id, JobState::Chunking, JobState::Embedding, TransitionUpdate::default())
            .await?;
        let embedding_started = Instant::now();
        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        let mut total_tokens: u64 = 0;
        let batch_size = self.config.embedding_batch_size.max(1);

        for (batch_index, batch) in chunks.chunks(batch_size).enumerate() {
            self.checkpoint(job_id)?;

            let batch_tokens: u64 = batch.iter().map(|chunk| estimate_tokens(chunk)).sum();
            if !self.rate_limiter.check(batch_tokens) {
                let usage = self.rate_limiter.usage();
                return Err(StageError::new(
                    ErrorKind::EmbeddingRateLimited,
                    format!(
                        "embedding rate limit exceeded: current {}, needed {}, limit {}",
                        usage.current_usage, batch_tokens, usage.limit
                    ),
                ));
            }

            let vectors = self
                .with_cancel_watch(job_id, async {
                    let _permit = self.embedding_pool.acquire().await;
                    self.collaborators.embedder.embed(batch).await
                })
                .await?;
            embeddings.extend(vectors);
            self.rate_limiter.record(batch_tokens);
            total_tokens += batch_tokens;

            let done = (batch_index * batch_size + batch.len()).min(chunks.len());
            let pct = 75.0 + (done as f32 / chunks.len() as f32) * 15.0;
            self.set_progress_meta(job_id, pct, &format!("embedded {}/{} chunks", done, chunks.len()))
                .await;

            // Gentle pacing between batches
            if done < chunks.len() {
                tokio::time::sleep(self.config.batch_pacing).await;
            }
        }

        metrics.chunks_embedded = embeddings.len();
        metrics.embedding_seconds = embedding_started.elapsed().as_secs_f64();
        metrics.embedding_tokens_used = total_tokens;
        metrics.estimated_cost_usd = total_tokens as f64 * COST_PER_TOKEN_USD;
        metrics.embedding_model = self.collaborators.embedder.model_name().to_string();

        // Stage: store vectors
        self.transition(job_id, JobState::Embedding, JobState::Storing, TransitionUpdate::default())
            .await?;
        self.checkpoint(job_id)?;

        let storage_started = Instant::now();
        let sha256 = report.sha256.clone().unwrap_or_default();
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings.iter())
            .enumerate()
            .map(|(index, (chunk, embedding))| VectorRecord {
                id: VectorRecord::chunk_id(&payload.document_id, index),
                document_id: payload.document_id,
                project_id: payload.project_id.clone(),
                embed_version: payload.embed_version.clone(),
                text: chunk.clone(),
                embedding: embedding.clone(),
                metadata: std::collections::HashMap::from([
                    ("project_id".to_string(), json!(payload.project_id)),
                    ("embed_version".to_string(), json!(payload.embed_version)),
                    ("source_sha256".to_string(), json!(sha256)),
                    ("chunk_size".to_string(), json!(payload.chunk_size)),
                    ("chunk_overlap".to_string(), json!(payload.chunk_overlap)),
                    ("created_at".to_string(), json!(Utc::now().to_rfc3339())),
                ]),
            })
            .collect();

        let stored = self
            .vector_store
            .add(records)
            .await
            .map_err(|e| StageError::new(e.error_kind(), e.to_string()))?;
        metrics.chunks_stored = stored.len();
        metrics.storage_seconds = storage_started.elapsed().as_secs_f64();

        // Finalize
        metrics.processing_seconds = job_started.elapsed().as_secs_f64();
        self.transition(
            job_id,
            JobState::Storing,
            JobState::Indexed,
            TransitionUpdate {
                metrics: Some(metrics.clone()),
                ..TransitionUpdate::default()
            },
        )
        .await?;

        self.store
            .upsert_document(DocumentRecord {
                id: payload.document_id,
                project_id: payload.project_id.clone(),
                file_id: payload.file_id.clone(),
                name: Some(file_info.name.clone()),
                sha256,
                file_size: Some(file_info.size),
                file_type: file_info.content_type.clone(),
                chunk_count: metrics.chunks_stored,
                embed_version: payload.embed_version.clone(),
                uploaded_at: record.created_at,
                indexed_at: Utc::now(),
            })
            .await
            .map_err(|e| StageError::new(ErrorKind::StorageUnavailable, e.to_string()))?;

        tracing::info!(
            "Job {} indexed: {} chunks, {} tokens, {:.2}s",
            job_id,
            metrics.chunks_stored,
            metrics.embedding_tokens_used,
            metrics.processing_seconds
        );
        Ok(metrics.chunks_stored)
    }

    /// CAS transition wrapper; a store rejection aborts the job.
    async fn transition(
        &self,
        job_id: JobId,
        from: JobState,
        to: JobState,
        update: TransitionUpdate,
    ) -> Result<JobRecord, StageError> {
        self.store
            .transition(job_id, from, to, update)
            .await
            .map_err(|e| StageError::new(ErrorKind::Unknown, e.to_string()))
    }

    /// Cancellation checkpoint, invoked at every stage transition, before
    /// each embedding batch, and on the watch interval inside long
    /// collaborator calls.
    fn checkpoint(&self, job_id: JobId) -> Result<(), StageError> {
        if let Some(flag) = self.cancels.check(job_id) {
            return Err(StageError::new(
                flag.kind.error_kind(),
                format!("job canceled: {}", flag.reason),
            ));
        }
        Ok(())
    }

    /// Drive a collaborator call while polling the cancel flag on the
    /// configured interval, so one long call cannot outrun a pending cancel.
    async fn with_cancel_watch<T, F>(&self, job_id: JobId, fut: F) -> Result<T, StageError>
    where
        F: std::future::Future<Output = Result<T, StageError>>,
    {
        tokio::pin!(fut);
        let mut ticker = tokio::time::interval(self.config.cancel_check_interval);
        // The first tick completes immediately; consume it up front.
        ticker.tick().await;
        loop {
            tokio::select! {
                result = &mut fut => return result,
                _ = ticker.tick() => self.checkpoint(job_id)?,
            }
        }
    }

    fn enforce_resources(&self, job_started: Instant) -> Result<(), StageError> {
        self.resource_guard
            .enforce(job_started)
            .map_err(|kind| StageError::new(kind, "resource limit exceeded"))
    }

    async fn set_progress_meta(&self, job_id: JobId, pct: f32, info: &str) {
        let _ = self.queue.set_meta(job_id, "progress_pct", json!(pct)).await;
        let _ = self.queue.set_meta(job_id, "step_info", json!(info)).await;
    }

    /// Move a job into its failure state, then either spawn a retry attempt
    /// or promote it to the dead-letter queue.
    async fn fail_job(
        &self,
        record: JobRecord,
        kind: ErrorKind,
        message: String,
        metrics: JobMetrics,
    ) -> Result<JobOutcome, StoreError> {
        let job_id = record.id;

        // Cancellation short-circuits straight to the terminal state.
        if kind.is_cancellation() {
            let canceled = self.store.transition(
                job_id,
                record.state,
                JobState::Canceled,
                TransitionUpdate {
                    cancel_reason: Some(message.clone()),
                    metrics: Some(metrics),
                    error: Some(JobError {
                        kind,
                        message,
                        details: None,
                        backtrace: None,
                    }),
                    ..TransitionUpdate::default()
                },
            );
            let final_record = canceled.await?;
            self.cancels.clear(job_id);
            return Ok(JobOutcome {
                job_id,
                final_state: final_record.state,
                chunks_stored: 0,
                retry_job_id: None,
                sent_to_dlq: false,
            });
        }

        let failure_state = record
            .state
            .failure_state()
            .unwrap_or(JobState::FailedValidation);
        let failed = match self
            .store
            .transition(
                job_id,
                record.state,
                failure_state,
                TransitionUpdate {
                    error: Some(JobError {
                        kind,
                        message: message.clone(),
                        details: None,
                        backtrace: None,
                    }),
                    metrics: Some(metrics),
                    ..TransitionUpdate::default()
                },
            )
            .await
        {
            Ok(failed) => failed,
            Err(e) => {
                // The record moved underneath us (concurrent cancel or an
                // edge with no failure state); leave it as found.
                tracing::warn!("Could not mark job {} failed: {}", job_id, e);
                return Ok(JobOutcome {
                    job_id,
                    final_state: record.state,
                    chunks_stored: 0,
                    retry_job_id: None,
                    sent_to_dlq: false,
                });
            }
        };

        let retry = should_retry(kind, failed.attempt) && failed.attempt <= failed.max_retries;
        if retry {
            let delay = kind.retry_policy().retry_delay_seconds(failed.attempt);
            match self.spawn_retry(&failed, delay).await {
                Ok(retry_job_id) => {
                    tracing::info!(
                        "Job {} failed with {}; retry {} scheduled in {}s",
                        job_id,
                        kind.code(),
                        retry_job_id,
                        delay
                    );
                    return Ok(JobOutcome {
                        job_id,
                        final_state: failure_state,
                        chunks_stored: 0,
                        retry_job_id: Some(retry_job_id),
                        sent_to_dlq: false,
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to spawn retry for job {}: {}", job_id, e);
                }
            }
        }

        // Out of retry budget (or spawn failed): dead-letter the job.
        self.promote_to_dlq(&failed, kind, &message).await?;
        Ok(JobOutcome {
            job_id,
            final_state: JobState::DeadLetter,
            chunks_stored: 0,
            retry_job_id: None,
            sent_to_dlq: true,
        })
    }

    pub(crate) async fn spawn_retry(
        &self,
        failed: &JobRecord,
        delay_seconds: u64,
    ) -> Result<JobId, StoreError> {
        let mut payload = JobPayload::new(
            failed.ingest_id.clone(),
            failed.project_id.clone(),
            failed.file_id.clone(),
        );
        payload.document_id = failed.document_id;
        payload.declared_content_type = failed.file_type.clone();
        payload.sha256 = failed.file_sha256.clone();
        payload.embed_version = failed.embed_version.clone();
        payload.chunk_size = failed.chunk_size;
        payload.chunk_overlap = failed.chunk_overlap;
        payload.force_ocr = failed.force_ocr;
        payload.attempt = failed.attempt + 1;
        payload.max_retries = failed.max_retries;
        payload.trace_id = failed.trace_id;

        let mut retry_record = JobRecord::from_payload(&payload);
        retry_record.parent_job_id = Some(failed.id);
        let retry_job_id = retry_record.id;

        self.store.insert(retry_record).await?;
        self.queue
            .enqueue(
                retry_job_id,
                payload,
                EnqueueOptions {
                    priority: Priority::Normal,
                    delay: Some(Duration::from_secs(delay_seconds)),
                },
            )
            .await
            .map_err(|e| StoreError::Backend { reason: e.to_string() })?;
        Ok(retry_job_id)
    }

    pub(crate) async fn promote_to_dlq(
        &self,
        failed: &JobRecord,
        kind: ErrorKind,
        message: &str,
    ) -> Result<(), StoreError> {
        let entry = DlqEntry {
            original_job_id: failed.id,
            ingest_id: failed.ingest_id.clone(),
            project_id: failed.project_id.clone(),
            kind,
            error_code: kind.code().to_string(),
            error_message: message.to_string(),
            last_step: failed.current_step.clone(),
            attempts: failed.attempt,
            failed_at: Utc::now(),
            first_attempt_at: Some(failed.created_at),
            trace_id: failed.trace_id,
            stack_trace: None,
            payload: None,
            analysis: None,
            resolved_at: None,
            resolution_notes: None,
            resolved_by: None,
        };

        if let Err(e) = self.dlq.process_entry(entry).await {
            tracing::error!("Failed to write DLQ entry for job {}: {}", failed.id, e);
        }

        self.store
            .transition(
                failed.id,
                failed.state,
                JobState::DeadLetter,
                TransitionUpdate::default(),
            )
            .await?;
        Ok(())
    }

    /// Fan a reindex request out into child ingest jobs with deterministic
    /// idempotency keys. Documents already at the target version are skipped
    /// unless `force` is set.
    pub async fn plan_reindex(
        &self,
        project_id: &str,
        new_embed_version: &str,
        batch_size: usize,
        force: bool,
    ) -> Result<ReindexReport, StoreError> {
        let all = self.store.list_documents(project_id, None).await?;
        let total = all.len();
        let candidates: Vec<DocumentRecord> = all
            .into_iter()
            .filter(|doc| force || doc.embed_version != new_embed_version)
            .collect();
        let skipped_current = total - candidates.len();
        let old_embed_version = candidates.first().map(|doc| doc.embed_version.clone());

        let mut jobs_enqueued = 0;
        let mut skipped_duplicate = 0;
        for doc in &candidates {
            let ingest_id = crate::types::reindex_ingest_id(&doc.id, new_embed_version);
            let mut payload = JobPayload::new(ingest_id, project_id.to_string(), doc.file_id.clone());
            payload.document_id = doc.id;
            payload.sha256 = Some(doc.sha256.clone());
            payload.embed_version = new_embed_version.to_string();
            payload.max_retries = self.config.max_retries;

            let record = JobRecord::from_payload(&payload);
            let job_id = record.id;
            match self.store.insert(record).await {
                Ok(()) => {
                    self.queue
                        .enqueue(job_id, payload, EnqueueOptions::default())
                        .await
                        .map_err(|e| StoreError::Backend { reason: e.to_string() })?;
                    jobs_enqueued += 1;
                }
                Err(StoreError::DuplicateIngest { .. }) => {
                    skipped_duplicate += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            "Reindex for project {}: {} candidates, {} enqueued, {} already current, {} duplicates",
            project_id,
            candidates.len(),
            jobs_enqueued,
            skipped_current,
            skipped_duplicate
        );

        Ok(ReindexReport {
            documents_to_reindex: candidates.len(),
            jobs_enqueued,
            skipped_current,
            skipped_duplicate,
            old_embed_version,
            new_embed_version: new_embed_version.to_string(),
            estimated_duration_minutes: (candidates.len() as u64 * 2) / batch_size.max(1) as u64,
        })
    }
}

/// OCR is warranted when extraction produced little or garbled text.
fn needs_ocr(text: &str, threshold: usize) -> bool {
    if text.trim().chars().count() < threshold {
        return true;
    }
    GARBLED_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Map a failed security report onto the most specific error kind. Security
/// rejections are validation failures and never retried.
fn classify_security_report(report: &crate::security::FileSecurityReport) -> ErrorKind {
    if !report.size_compliant {
        return ErrorKind::FileTooLarge;
    }
    ErrorKind::InvalidFileType
}
