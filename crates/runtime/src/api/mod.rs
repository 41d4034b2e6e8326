//! HTTP API for the ingestion runtime

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::IngestRuntime;

pub mod routes;
pub mod types;

/// Build the API router over a shared runtime handle.
pub fn router(runtime: Arc<IngestRuntime>) -> Router {
    Router::new()
        .route("/ingest", post(routes::submit_ingest))
        .route("/jobs/:id", get(routes::get_job_status))
        .route("/jobs/:id/cancel", post(routes::cancel_job))
        .route("/jobs/:id/retry", post(routes::retry_job))
        .route("/reindex-all", post(routes::reindex_all))
        .route("/dlq", get(routes::list_dlq))
        .route("/dlq/:id/resolve", post(routes::resolve_dlq_entry))
        .route("/dlq/report", get(routes::dlq_report))
        .route("/queue/stats", get(routes::queue_stats))
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(runtime)
}

/// Serve the API until the process is stopped.
pub async fn serve(runtime: Arc<IngestRuntime>, bind_addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("HTTP API listening on {}", bind_addr);
    axum::serve(listener, router(runtime)).await
}
