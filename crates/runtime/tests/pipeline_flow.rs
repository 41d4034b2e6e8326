//! End-to-end pipeline scenarios against in-memory backends

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use ingestd_runtime::config::RuntimeConfig;
use ingestd_runtime::dlq::ErrorCategory;
use ingestd_runtime::pipeline::stages::{
    EmbeddingModel, FileInfo, FileSource, OcrEngine, OcrOutput, SlidingWindowChunker, StageError,
    TextChunker, TextExtractor,
};
use ingestd_runtime::pipeline::PipelineCollaborators;
use ingestd_runtime::store::DocumentRecord;
use ingestd_runtime::types::{
    reindex_ingest_id, CancelKind, DocumentId, ErrorKind, JobId, JobState, Priority,
};
use ingestd_runtime::vector::{InMemoryVectorStore, VectorStore};
use ingestd_runtime::{IngestRuntime, IngestSubmission, RuntimeError};

/// File source with fixed contents per file id
struct FixtureFileSource {
    files: HashMap<String, Vec<u8>>,
}

impl FixtureFileSource {
    fn new(files: Vec<(&str, Vec<u8>)>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(id, bytes)| (id.to_string(), bytes))
                .collect(),
        }
    }
}

#[async_trait]
impl FileSource for FixtureFileSource {
    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo, StageError> {
        let bytes = self.files.get(file_id).ok_or_else(|| {
            StageError::new(ErrorKind::FileNotFound, format!("file not found: {}", file_id))
        })?;
        Ok(FileInfo {
            file_id: file_id.to_string(),
            name: format!("{}.txt", file_id),
            size: bytes.len() as u64,
            content_type: Some("text/plain".to_string()),
        })
    }

    async fn read(&self, file_id: &str) -> Result<Vec<u8>, StageError> {
        self.files.get(file_id).cloned().ok_or_else(|| {
            StageError::new(ErrorKind::FileNotFound, format!("file not found: {}", file_id))
        })
    }
}

/// Extractor that returns the file as UTF-8 text
struct Utf8Extractor;

#[async_trait]
impl TextExtractor for Utf8Extractor {
    async fn extract(&self, path: &Path, _content_type: Option<&str>) -> Result<String, StageError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StageError::new(ErrorKind::ExtractionFailed, e.to_string()))?;
        String::from_utf8(bytes)
            .map_err(|_| StageError::new(ErrorKind::ExtractionFailed, "not valid utf-8"))
    }
}

/// Embedder returning fixed-dimension vectors with an optional per-batch delay
struct FixedEmbedder {
    dimension: usize,
    batch_delay: Duration,
}

#[async_trait]
impl EmbeddingModel for FixedEmbedder {
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, StageError> {
        if !self.batch_delay.is_zero() {
            tokio::time::sleep(self.batch_delay).await;
        }
        Ok(batch.iter().map(|_| vec![0.1; self.dimension]).collect())
    }

    fn model_name(&self) -> &str {
        "fixed-test-embedder"
    }

    async fn healthy(&self) -> bool {
        true
    }
}

struct Harness {
    runtime: Arc<IngestRuntime>,
    vector_store: Arc<InMemoryVectorStore>,
}

fn build_custom_harness(
    tweak: impl FnOnce(&mut RuntimeConfig),
    collaborators: PipelineCollaborators,
) -> Harness {
    let mut config = RuntimeConfig::default();
    // Tests poll aggressively; promote delayed jobs quickly.
    config.queue.promotion_interval = Duration::from_millis(20);
    tweak(&mut config);

    let vector_store = Arc::new(InMemoryVectorStore::new());
    let store: Arc<dyn VectorStore> = vector_store.clone();
    let runtime = IngestRuntime::new(config, collaborators, store);
    Harness {
        runtime,
        vector_store,
    }
}

fn build_harness(
    files: Vec<(&str, Vec<u8>)>,
    tweak: impl FnOnce(&mut RuntimeConfig),
    batch_delay: Duration,
) -> Harness {
    build_custom_harness(
        tweak,
        PipelineCollaborators {
            file_source: Arc::new(FixtureFileSource::new(files)),
            extractor: Arc::new(Utf8Extractor),
            ocr: None,
            chunker: Arc::new(SlidingWindowChunker),
            embedder: Arc::new(FixedEmbedder {
                dimension: 1536,
                batch_delay,
            }),
        },
    )
}

fn submission(ingest_id: &str, file_id: &str) -> IngestSubmission {
    IngestSubmission {
        ingest_id: ingest_id.to_string(),
        project_id: "project-1".to_string(),
        file_id: file_id.to_string(),
        chunk_size: Some(1024),
        chunk_overlap: Some(128),
        force_ocr: false,
        priority: Priority::Normal,
    }
}

async fn wait_for<F>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
{
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn wait_for_state(
    runtime: &Arc<IngestRuntime>,
    job_id: JobId,
    state: JobState,
    deadline: Duration,
) -> bool {
    let store = runtime.store();
    wait_for(deadline, move || {
        let store = store.clone();
        Box::pin(async move {
            store
                .load(job_id)
                .await
                .map(|record| record.state == state)
                .unwrap_or(false)
        })
    })
    .await
}

fn sample_text(words: usize) -> Vec<u8> {
    let mut text = String::new();
    for index in 0..words {
        text.push_str(&format!("word{} ", index));
    }
    text.into_bytes()
}

#[tokio::test]
async fn happy_path_reaches_indexed_with_all_chunks_stored() {
    let harness = build_harness(
        vec![("file-1", sample_text(6000))],
        |config| config.rate_limit.max_tokens_per_window = 1_000_000,
        Duration::ZERO,
    );
    harness.runtime.start_workers(1);

    let receipt = harness
        .runtime
        .submit_ingest(submission("ingest-happy", "file-1"))
        .await
        .unwrap();

    assert!(
        wait_for_state(&harness.runtime, receipt.job_id, JobState::Indexed, Duration::from_secs(10)).await,
        "job never reached indexed"
    );

    let record = harness.runtime.store().load(receipt.job_id).await.unwrap();
    assert_eq!(record.progress_pct, 100.0);
    assert!(record.ended_at.is_some());

    let metrics = record.metrics.expect("metrics recorded");
    assert!(metrics.chunks_created > 0);
    assert_eq!(metrics.chunks_embedded, metrics.chunks_created);
    assert_eq!(metrics.chunks_stored, metrics.chunks_created);
    assert!(metrics.embedding_tokens_used > 0);
    assert!(metrics.estimated_cost_usd > 0.0);
    assert_eq!(metrics.embedding_model, "fixed-test-embedder");

    // Vector store holds exactly the stored chunks
    assert_eq!(harness.vector_store.count().await.unwrap(), metrics.chunks_stored);

    // Document row upserted with the job's embed version
    let documents = harness
        .runtime
        .store()
        .list_documents("project-1", None)
        .await
        .unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].chunk_count, metrics.chunks_stored);
}

#[tokio::test]
async fn duplicate_ingest_id_returns_existing_job() {
    let harness = build_harness(vec![("file-1", sample_text(100))], |_| {}, Duration::ZERO);

    let first = harness
        .runtime
        .submit_ingest(submission("ingest-dup", "file-1"))
        .await
        .unwrap();

    let second = harness
        .runtime
        .submit_ingest(submission("ingest-dup", "file-1"))
        .await
        .unwrap_err();

    match second {
        RuntimeError::DuplicateIngest { job_id, ingest_id } => {
            assert_eq!(job_id, first.job_id);
            assert_eq!(ingest_id, "ingest-dup");
        }
        other => panic!("expected DuplicateIngest, got {other:?}"),
    }

    // No extra job record exists for the ingest id
    let chain = harness.runtime.store().retry_chain("ingest-dup").await.unwrap();
    assert_eq!(chain.len(), 1);
}

#[tokio::test]
async fn rate_limited_job_fails_fast_and_schedules_delayed_retry() {
    let harness = build_harness(
        vec![("file-1", sample_text(600))],
        |config| config.rate_limit.max_tokens_per_window = 100,
        Duration::ZERO,
    );
    harness.runtime.start_workers(1);

    let receipt = harness
        .runtime
        .submit_ingest(submission("ingest-limited", "file-1"))
        .await
        .unwrap();

    assert!(
        wait_for_state(&harness.runtime, receipt.job_id, JobState::FailedEmbed, Duration::from_secs(10)).await,
        "job never hit the embed failure"
    );

    let failed = harness.runtime.store().load(receipt.job_id).await.unwrap();
    let error = failed.error.expect("error recorded");
    assert_eq!(error.kind, ErrorKind::EmbeddingRateLimited);
    // Progress frozen at the embedding stage value
    assert_eq!(failed.progress_pct, 75.0);

    // A retry attempt is linked and waiting on its 30s delay
    let store = harness.runtime.store();
    assert!(
        wait_for(Duration::from_secs(5), move || {
            let store = store.clone();
            Box::pin(async move {
                store
                    .retry_chain("ingest-limited")
                    .await
                    .map(|chain| chain.len() == 2)
                    .unwrap_or(false)
            })
        })
        .await,
        "retry attempt never spawned"
    );

    let chain = harness.runtime.store().retry_chain("ingest-limited").await.unwrap();
    assert_eq!(chain[1].attempt, 2);
    assert_eq!(chain[1].parent_job_id, Some(receipt.job_id));
    assert_eq!(chain[1].state, JobState::Queued);

    // Nothing was stored and nothing dead-lettered
    assert_eq!(harness.vector_store.count().await.unwrap(), 0);
    assert_eq!(harness.runtime.dlq().store().open_count().await.unwrap(), 0);
}

#[tokio::test]
async fn malicious_file_is_rejected_and_dead_lettered() {
    let harness = build_harness(
        vec![("file-bad", b"<script>alert('owned')</script> plus harmless text".to_vec())],
        |_| {},
        Duration::ZERO,
    );
    harness.runtime.start_workers(1);

    let receipt = harness
        .runtime
        .submit_ingest(submission("ingest-bad", "file-bad"))
        .await
        .unwrap();

    assert!(
        wait_for_state(&harness.runtime, receipt.job_id, JobState::DeadLetter, Duration::from_secs(10)).await,
        "job never reached the dead letter queue"
    );

    let record = harness.runtime.store().load(receipt.job_id).await.unwrap();
    let error = record.error.expect("error recorded");
    assert_eq!(error.kind, ErrorKind::InvalidFileType);

    // Exactly one DLQ entry, categorised as file handling, not retryable
    let listing = harness.runtime.dlq().store().list(10, None).await.unwrap();
    assert_eq!(listing.total, 1);
    let entry = &listing.entries[0];
    assert_eq!(entry.original_job_id, receipt.job_id);
    let analysis = entry.analysis.as_ref().expect("analysis attached");
    assert_eq!(analysis.category, ErrorCategory::FileHandling);
    assert!(!analysis.retry_recommended);
    assert!(!analysis.is_critical);

    // No vectors written for a rejected file
    assert_eq!(harness.vector_store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_during_embedding_stops_before_storing() {
    let harness = build_harness(
        vec![("file-slow", sample_text(4000))],
        |config| {
            config.rate_limit.max_tokens_per_window = 1_000_000;
            config.worker.embedding_batch_size = 10;
        },
        Duration::from_millis(50),
    );
    harness.runtime.start_workers(1);

    let mut request = submission("ingest-cancel", "file-slow");
    request.chunk_size = Some(64);
    request.chunk_overlap = Some(8);
    let receipt = harness.runtime.submit_ingest(request).await.unwrap();

    // Let a few embedding batches finish before canceling
    assert!(
        wait_for_state(&harness.runtime, receipt.job_id, JobState::Embedding, Duration::from_secs(10)).await,
        "job never started embedding"
    );
    tokio::time::sleep(Duration::from_millis(120)).await;

    let accepted = harness
        .runtime
        .cancel_job(receipt.job_id, CancelKind::User, "operator stop")
        .await
        .unwrap();
    assert!(accepted);

    assert!(
        wait_for_state(&harness.runtime, receipt.job_id, JobState::Canceled, Duration::from_secs(5)).await,
        "cancel not observed within the checkpoint window"
    );

    let record = harness.runtime.store().load(receipt.job_id).await.unwrap();
    assert_eq!(record.cancel_reason.as_deref(), Some("job canceled: operator stop"));
    assert!(record.canceled_at.is_some());

    // Storing never ran and the cancellation is not a DLQ matter
    assert_eq!(harness.vector_store.count().await.unwrap(), 0);
    assert_eq!(harness.runtime.dlq().store().open_count().await.unwrap(), 0);
}

/// Extractor that holds one call open far longer than the cancel interval
struct SlowExtractor {
    delay: Duration,
}

#[async_trait]
impl TextExtractor for SlowExtractor {
    async fn extract(&self, _path: &Path, _content_type: Option<&str>) -> Result<String, StageError> {
        tokio::time::sleep(self.delay).await;
        Ok("slowly extracted text that is perfectly usable ".repeat(20))
    }
}

/// OCR engine that sleeps through its single call
struct SlowOcr {
    delay: Duration,
}

#[async_trait]
impl OcrEngine for SlowOcr {
    async fn recognize(&self, _path: &Path) -> Result<OcrOutput, StageError> {
        tokio::time::sleep(self.delay).await;
        Ok(OcrOutput {
            text: "recognized text from a very slow engine ".repeat(20),
            confidence: 0.9,
        })
    }
}

/// Chunker that sleeps before producing chunks
struct SlowChunker {
    delay: Duration,
}

#[async_trait]
impl TextChunker for SlowChunker {
    async fn chunk(
        &self,
        text: &str,
        _chunk_size: usize,
        _chunk_overlap: usize,
    ) -> Result<Vec<String>, StageError> {
        tokio::time::sleep(self.delay).await;
        Ok(vec![text.to_string()])
    }
}

fn slow_stage_collaborators(
    extractor: Arc<dyn TextExtractor>,
    ocr: Option<Arc<dyn OcrEngine>>,
    chunker: Arc<dyn TextChunker>,
) -> PipelineCollaborators {
    PipelineCollaborators {
        file_source: Arc::new(FixtureFileSource::new(vec![("file-slow", sample_text(200))])),
        extractor,
        ocr,
        chunker,
        embedder: Arc::new(FixedEmbedder {
            dimension: 1536,
            batch_delay: Duration::ZERO,
        }),
    }
}

async fn assert_cancel_observed_during(
    harness: &Harness,
    state: JobState,
    submission: IngestSubmission,
) {
    harness.runtime.start_workers(1);
    let receipt = harness.runtime.submit_ingest(submission).await.unwrap();

    assert!(
        wait_for_state(&harness.runtime, receipt.job_id, state, Duration::from_secs(10)).await,
        "job never reached {state}"
    );

    let accepted = harness
        .runtime
        .cancel_job(receipt.job_id, CancelKind::User, "operator stop")
        .await
        .unwrap();
    assert!(accepted);

    // The collaborator call sleeps far longer than this deadline; the watch
    // interval must surface the cancel mid-call.
    assert!(
        wait_for_state(&harness.runtime, receipt.job_id, JobState::Canceled, Duration::from_secs(3)).await,
        "cancel not observed within the watch interval while {state}"
    );

    assert_eq!(harness.vector_store.count().await.unwrap(), 0);
    assert_eq!(harness.runtime.dlq().store().open_count().await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_during_extraction_observed_mid_call() {
    let harness = build_custom_harness(
        |config| config.worker.cancel_check_interval = Duration::from_millis(100),
        slow_stage_collaborators(
            Arc::new(SlowExtractor { delay: Duration::from_secs(30) }),
            None,
            Arc::new(SlidingWindowChunker),
        ),
    );
    assert_cancel_observed_during(
        &harness,
        JobState::Extracting,
        submission("ingest-cancel-extract", "file-slow"),
    )
    .await;
}

#[tokio::test]
async fn cancellation_during_ocr_observed_mid_call() {
    let harness = build_custom_harness(
        |config| config.worker.cancel_check_interval = Duration::from_millis(100),
        slow_stage_collaborators(
            Arc::new(Utf8Extractor),
            Some(Arc::new(SlowOcr { delay: Duration::from_secs(30) })),
            Arc::new(SlidingWindowChunker),
        ),
    );
    let mut request = submission("ingest-cancel-ocr", "file-slow");
    request.force_ocr = true;
    assert_cancel_observed_during(&harness, JobState::Ocr, request).await;
}

#[tokio::test]
async fn cancellation_during_chunking_observed_mid_call() {
    let harness = build_custom_harness(
        |config| config.worker.cancel_check_interval = Duration::from_millis(100),
        slow_stage_collaborators(
            Arc::new(Utf8Extractor),
            None,
            Arc::new(SlowChunker { delay: Duration::from_secs(30) }),
        ),
    );
    assert_cancel_observed_during(
        &harness,
        JobState::Chunking,
        submission("ingest-cancel-chunk", "file-slow"),
    )
    .await;
}

#[tokio::test]
async fn cancel_of_terminal_job_is_rejected() {
    let harness = build_harness(
        vec![("file-1", sample_text(200))],
        |config| config.rate_limit.max_tokens_per_window = 1_000_000,
        Duration::ZERO,
    );
    harness.runtime.start_workers(1);

    let receipt = harness
        .runtime
        .submit_ingest(submission("ingest-done", "file-1"))
        .await
        .unwrap();
    assert!(wait_for_state(&harness.runtime, receipt.job_id, JobState::Indexed, Duration::from_secs(10)).await);

    let accepted = harness
        .runtime
        .cancel_job(receipt.job_id, CancelKind::User, "too late")
        .await
        .unwrap();
    assert!(!accepted);
}

#[tokio::test]
async fn reindex_skips_current_versions_and_uses_deterministic_ids() {
    let harness = build_harness(
        vec![
            ("file-a", sample_text(200)),
            ("file-b", sample_text(220)),
            ("file-c", sample_text(240)),
        ],
        |config| {
            config.rate_limit.max_tokens_per_window = 1_000_000;
            config.worker.embed_version = "v2.0".to_string();
        },
        Duration::ZERO,
    );

    // Seed five documents: three stale, two already current
    let now = Utc::now();
    let store = harness.runtime.store();
    let mut stale_ids = Vec::new();
    for (index, file_id) in ["file-a", "file-b", "file-c"].iter().enumerate() {
        let id = DocumentId::new();
        stale_ids.push(id);
        store
            .upsert_document(DocumentRecord {
                id,
                project_id: "project-1".to_string(),
                file_id: file_id.to_string(),
                name: Some(format!("doc-{}", index)),
                sha256: format!("{:02x}", index),
                file_size: Some(100),
                file_type: Some("text/plain".to_string()),
                chunk_count: 3,
                embed_version: "v1.0".to_string(),
                uploaded_at: now,
                indexed_at: now,
            })
            .await
            .unwrap();
    }
    for index in 0..2 {
        store
            .upsert_document(DocumentRecord {
                id: DocumentId::new(),
                project_id: "project-1".to_string(),
                file_id: format!("current-{}", index),
                name: None,
                sha256: "ff".to_string(),
                file_size: None,
                file_type: None,
                chunk_count: 2,
                embed_version: "v2.0".to_string(),
                uploaded_at: now,
                indexed_at: now,
            })
            .await
            .unwrap();
    }

    let report = harness
        .runtime
        .executor()
        .plan_reindex("project-1", "v2.0", 10, false)
        .await
        .unwrap();

    assert_eq!(report.documents_to_reindex, 3);
    assert_eq!(report.jobs_enqueued, 3);
    assert_eq!(report.skipped_current, 2);
    assert_eq!(report.old_embed_version.as_deref(), Some("v1.0"));

    // Deterministic idempotency keys: a second plan enqueues nothing new
    for id in &stale_ids {
        let ingest_id = reindex_ingest_id(id, "v2.0");
        let chain = store.retry_chain(&ingest_id).await.unwrap();
        assert_eq!(chain.len(), 1, "missing child job for {}", ingest_id);
    }
    let again = harness
        .runtime
        .executor()
        .plan_reindex("project-1", "v2.0", 10, false)
        .await
        .unwrap();
    assert_eq!(again.jobs_enqueued, 0);
    assert_eq!(again.skipped_duplicate, 3);

    // Run the children to completion; every document ends up current
    harness.runtime.start_workers(2);
    let store_for_wait = harness.runtime.store();
    assert!(
        wait_for(Duration::from_secs(15), move || {
            let store = store_for_wait.clone();
            Box::pin(async move {
                store
                    .list_documents("project-1", Some("v2.0"))
                    .await
                    .map(|stale| stale.is_empty())
                    .unwrap_or(false)
            })
        })
        .await,
        "documents never converged on the new embed version"
    );
}
