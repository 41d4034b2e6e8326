//! HTTP API route handlers

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;

use super::types::*;
use crate::types::{CancelKind, ErrorKind, JobId, Priority};
use crate::{IngestRuntime, IngestSubmission, RuntimeError};

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(code: &str, message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(code, message)))
}

fn not_found(message: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new("NOT_FOUND", message)))
}

fn internal(message: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("INTERNAL_ERROR", message)),
    )
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| bad_request("INVALID_JOB_ID", format!("not a job id: {}", raw)))
}

/// Ingest submission endpoint handler
pub async fn submit_ingest(
    State(runtime): State<Arc<IngestRuntime>>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), (StatusCode, Json<serde_json::Value>)> {
    let ingest_id = headers
        .get("x-ingest-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "code": "MISSING_INGEST_ID",
                    "error": "the X-Ingest-Id header is required",
                })),
            )
        })?;

    let priority = headers
        .get("x-priority")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Priority>().ok())
        .unwrap_or_default();

    let submission = IngestSubmission {
        ingest_id: ingest_id.clone(),
        project_id: request.project_id,
        file_id: request.file_id,
        chunk_size: request.chunk_size,
        chunk_overlap: request.chunk_overlap,
        force_ocr: request.force_ocr,
        priority,
    };

    match runtime.submit_ingest(submission).await {
        Ok(receipt) => Ok((
            StatusCode::ACCEPTED,
            Json(IngestResponse {
                job_id: receipt.job_id,
                ingest_id: receipt.ingest_id,
                queue_position: receipt.queue_position,
                estimated_start_time: receipt.estimated_start_time,
            }),
        )),
        Err(RuntimeError::DuplicateIngest { ingest_id, job_id }) => Err((
            StatusCode::CONFLICT,
            Json(serde_json::json!(DuplicateIngestResponse {
                code: "DUPLICATE_INGEST".to_string(),
                job_id,
                ingest_id,
            })),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "code": "ENQUEUE_FAILED",
                "error": e.to_string(),
            })),
        )),
    }
}

/// Job status endpoint handler
pub async fn get_job_status(
    State(runtime): State<Arc<IngestRuntime>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let view = runtime
        .job_status(job_id)
        .await
        .map_err(|e| not_found(e.to_string()))?;

    let record = view.record;
    Ok(Json(JobStatusResponse {
        job_id: record.id,
        ingest_id: record.ingest_id,
        state: record.state,
        progress_pct: record.progress_pct,
        current_step: record.current_step,
        created_at: record.created_at,
        started_at: record.started_at,
        ended_at: record.ended_at,
        estimated_remaining_seconds: view.estimated_remaining_seconds,
        document_id: Some(record.document_id.to_string()),
        chunks_indexed: view.chunks_indexed,
        error_code: record.error.as_ref().map(|e| e.kind.code().to_string()),
        error_message: record.error.as_ref().map(|e| e.message.clone()),
        retry_count: record.attempt.saturating_sub(1),
        queue_position: view.queue_position,
    }))
}

/// Cancel endpoint handler
pub async fn cancel_job(
    State(runtime): State<Arc<IngestRuntime>>,
    Path(job_id): Path<String>,
    Query(params): Query<CancelParams>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let reason = params.reason.unwrap_or_else(|| "user requested".to_string());

    match runtime.cancel_job(job_id, CancelKind::User, &reason).await {
        Ok(true) => Ok(Json(CancelResponse {
            accepted: true,
            reason: None,
        })),
        Ok(false) => Ok(Json(CancelResponse {
            accepted: false,
            reason: Some("terminal".to_string()),
        })),
        Err(RuntimeError::JobNotFound { .. }) => Err(not_found(format!("job {} not found", job_id))),
        Err(e) => Err(internal(e.to_string())),
    }
}

/// Manual retry endpoint handler
pub async fn retry_job(
    State(runtime): State<Arc<IngestRuntime>>,
    Path(job_id): Path<String>,
    Query(params): Query<RetryParams>,
) -> Result<Json<crate::RetryReceipt>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    match runtime
        .retry_job(job_id, params.max_retries, params.delay_seconds)
        .await
    {
        Ok(receipt) => Ok(Json(receipt)),
        Err(RuntimeError::JobNotFound { .. }) => Err(not_found(format!("job {} not found", job_id))),
        Err(RuntimeError::NotRetryable { state, .. }) => Err(bad_request(
            "NOT_RETRYABLE",
            format!("job is in state {} and cannot be retried", state),
        )),
        Err(e) => Err(internal(e.to_string())),
    }
}

/// Reindex endpoint handler
pub async fn reindex_all(
    State(runtime): State<Arc<IngestRuntime>>,
    Json(request): Json<ReindexRequest>,
) -> Result<Json<ReindexResponse>, ApiError> {
    if request.project_id.len() < 3 {
        return Err(bad_request("INVALID_PROJECT", "invalid project_id"));
    }
    let new_version = request
        .new_embed_version
        .unwrap_or_else(|| runtime.config.worker.embed_version.clone());

    let report = runtime
        .executor()
        .plan_reindex(
            &request.project_id,
            &new_version,
            request.batch_size,
            request.force_reindex,
        )
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(ReindexResponse {
        reindex_job_id: format!("reindex-all-{}-{}", request.project_id, uuid::Uuid::new_v4()),
        documents_to_reindex: report.documents_to_reindex,
        old_embed_version: report.old_embed_version,
        new_embed_version: report.new_embed_version,
        estimated_duration_minutes: report.estimated_duration_minutes,
        batch_size: request.batch_size,
    }))
}

/// DLQ listing endpoint handler
pub async fn list_dlq(
    State(runtime): State<Arc<IngestRuntime>>,
    Query(params): Query<DlqListParams>,
) -> Result<Json<crate::dlq::DlqListing>, ApiError> {
    let kind_filter = match params.error_type_filter.as_deref() {
        Some(code) => Some(
            ErrorKind::from_code(code)
                .ok_or_else(|| bad_request("INVALID_ERROR_TYPE", format!("unknown error type: {}", code)))?,
        ),
        None => None,
    };

    runtime
        .dlq()
        .store()
        .list(params.limit.unwrap_or(50), kind_filter)
        .await
        .map(Json)
        .map_err(|e| internal(e.to_string()))
}

/// DLQ resolution endpoint handler
pub async fn resolve_dlq_entry(
    State(runtime): State<Arc<IngestRuntime>>,
    Path(job_id): Path<String>,
    Json(request): Json<DlqResolveRequest>,
) -> Result<Json<crate::dlq::DlqEntry>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    runtime
        .dlq()
        .store()
        .resolve(job_id, &request.resolved_by, &request.notes)
        .await
        .map(Json)
        .map_err(|e| not_found(e.to_string()))
}

/// DLQ trend report endpoint handler
pub async fn dlq_report(
    State(runtime): State<Arc<IngestRuntime>>,
    Query(params): Query<DlqReportParams>,
) -> Result<Json<crate::dlq::DlqTrendReport>, ApiError> {
    runtime
        .dlq()
        .report(params.days.unwrap_or(7))
        .await
        .map(Json)
        .map_err(|e| internal(e.to_string()))
}

/// Queue statistics endpoint handler
pub async fn queue_stats(
    State(runtime): State<Arc<IngestRuntime>>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let stats = runtime.queue_stats().await.map_err(|e| internal(e.to_string()))?;
    Ok(Json(QueueStatsResponse {
        queue_length: stats.queue_length,
        dlq_length: stats.dlq_length,
        processing_jobs: stats.processing_jobs,
        active_workers: stats.active_workers,
        total_workers: stats.total_workers,
        embedding_rate_current: stats.embedding_rate.current_usage,
        embedding_rate_limit: stats.embedding_rate.limit,
        embed_version: stats.embed_version,
        queue_health: stats.queue_health,
    }))
}

/// Liveness endpoint handler
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Readiness endpoint handler
pub async fn readyz(
    State(runtime): State<Arc<IngestRuntime>>,
) -> Result<Json<ReadyResponse>, ApiError> {
    let readiness = runtime.readiness().await;
    let response = ReadyResponse {
        ready: readiness.ready,
        queue_ok: readiness.queue_ok,
        store_ok: readiness.store_ok,
        vector_store_ok: readiness.vector_store_ok,
        embedder_ok: readiness.embedder_ok,
    };
    if readiness.ready {
        Ok(Json(response))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("NOT_READY", "one or more dependencies are unreachable")),
        ))
    }
}
