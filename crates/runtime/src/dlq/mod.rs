//! Dead-letter queue for terminally failed jobs
//!
//! Entries are written once per terminal job, analyzed for category and
//! severity, surfaced to operators, and aged out on a schedule: resolved
//! entries are deleted after the retention window, unresolved ones are
//! auto-resolved with a system note.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::interval;

use crate::config::DlqConfig;
use crate::types::{ErrorKind, JobId, JobPayload, TraceId};

pub mod analyzer;

pub use analyzer::{DlqAnalyzer, DlqTrendReport, ErrorAnalysis, ErrorCategory, Severity};

/// DLQ errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DlqError {
    #[error("DLQ entry not found for job {job_id}")]
    NotFound { job_id: JobId },

    #[error("DLQ backend error: {reason}")]
    Backend { reason: String },
}

/// Snapshot of a terminally failed job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Keyed by the terminal job id; writes are idempotent on it.
    pub original_job_id: JobId,
    pub ingest_id: String,
    pub project_id: String,

    pub kind: ErrorKind,
    pub error_code: String,
    pub error_message: String,
    pub last_step: String,

    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub first_attempt_at: Option<DateTime<Utc>>,

    pub trace_id: TraceId,
    pub stack_trace: Option<String>,
    pub payload: Option<JobPayload>,

    pub analysis: Option<ErrorAnalysis>,

    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub resolved_by: Option<String>,
}

impl DlqEntry {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Filtered listing of DLQ entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqListing {
    pub entries: Vec<DlqEntry>,
    pub total: usize,
    pub resolved_count: usize,
    pub error_type_counts: HashMap<String, usize>,
}

/// Result of one cleanup pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqCleanupReport {
    pub deleted_resolved: usize,
    pub auto_resolved: usize,
}

/// Durable store of DLQ entries
#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Insert an entry; a second write for the same terminal job is a no-op.
    async fn insert(&self, entry: DlqEntry) -> Result<(), DlqError>;

    async fn get(&self, job_id: JobId) -> Result<DlqEntry, DlqError>;

    async fn list(
        &self,
        limit: usize,
        kind_filter: Option<ErrorKind>,
    ) -> Result<DlqListing, DlqError>;

    /// Attach analysis after the entry has been examined.
    async fn set_analysis(&self, job_id: JobId, analysis: ErrorAnalysis) -> Result<(), DlqError>;

    async fn resolve(
        &self,
        job_id: JobId,
        resolved_by: &str,
        notes: &str,
    ) -> Result<DlqEntry, DlqError>;

    /// Unresolved entries only.
    async fn open_count(&self) -> Result<usize, DlqError>;

    /// Unresolved entries of the same kind failed since `cutoff`.
    async fn count_similar(&self, kind: ErrorKind, cutoff: DateTime<Utc>) -> Result<usize, DlqError>;

    /// Every entry that failed since `cutoff`, for trend analysis.
    async fn entries_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<DlqEntry>, DlqError>;

    /// Apply retention policy: delete old resolved entries, auto-resolve
    /// stale unresolved ones.
    async fn cleanup(&self, config: &DlqConfig) -> Result<DlqCleanupReport, DlqError>;
}

/// In-process DLQ store
pub struct InMemoryDlqStore {
    entries: RwLock<HashMap<JobId, DlqEntry>>,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDlqStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn insert(&self, entry: DlqEntry) -> Result<(), DlqError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&entry.original_job_id) {
            tracing::debug!("DLQ entry for job {} already exists", entry.original_job_id);
            return Ok(());
        }
        tracing::info!(
            "DLQ entry written for job {} ({}, {} attempts)",
            entry.original_job_id,
            entry.error_code,
            entry.attempts
        );
        entries.insert(entry.original_job_id, entry);
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<DlqEntry, DlqError> {
        self.entries
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(DlqError::NotFound { job_id })
    }

    async fn list(
        &self,
        limit: usize,
        kind_filter: Option<ErrorKind>,
    ) -> Result<DlqListing, DlqError> {
        let entries = self.entries.read();
        let mut error_type_counts: HashMap<String, usize> = HashMap::new();
        let mut resolved_count = 0;
        for entry in entries.values() {
            *error_type_counts.entry(entry.error_code.clone()).or_default() += 1;
            if entry.is_resolved() {
                resolved_count += 1;
            }
        }

        let mut selected: Vec<DlqEntry> = entries
            .values()
            .filter(|entry| kind_filter.map_or(true, |kind| entry.kind == kind))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        selected.truncate(limit);

        Ok(DlqListing {
            total: entries.len(),
            resolved_count,
            error_type_counts,
            entries: selected,
        })
    }

    async fn set_analysis(&self, job_id: JobId, analysis: ErrorAnalysis) -> Result<(), DlqError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&job_id).ok_or(DlqError::NotFound { job_id })?;
        entry.analysis = Some(analysis);
        Ok(())
    }

    async fn resolve(
        &self,
        job_id: JobId,
        resolved_by: &str,
        notes: &str,
    ) -> Result<DlqEntry, DlqError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&job_id).ok_or(DlqError::NotFound { job_id })?;
        entry.resolved_at = Some(Utc::now());
        entry.resolved_by = Some(resolved_by.to_string());
        entry.resolution_notes = Some(notes.to_string());
        tracing::info!("DLQ entry {} resolved by {}", job_id, resolved_by);
        Ok(entry.clone())
    }

    async fn open_count(&self) -> Result<usize, DlqError> {
        Ok(self.entries.read().values().filter(|entry| !entry.is_resolved()).count())
    }

    async fn count_similar(&self, kind: ErrorKind, cutoff: DateTime<Utc>) -> Result<usize, DlqError> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|entry| entry.kind == kind && entry.failed_at >= cutoff && !entry.is_resolved())
            .count())
    }

    async fn entries_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<DlqEntry>, DlqError> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|entry| entry.failed_at >= cutoff)
            .cloned()
            .collect())
    }

    async fn cleanup(&self, config: &DlqConfig) -> Result<DlqCleanupReport, DlqError> {
        let now = Utc::now();
        let delete_cutoff = now - ChronoDuration::days(config.retention_days);
        let auto_resolve_cutoff = now - ChronoDuration::days(config.auto_resolve_after_days);

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            !matches!(entry.resolved_at, Some(resolved) if resolved < delete_cutoff)
        });
        let deleted_resolved = before - entries.len();

        let mut auto_resolved = 0;
        for entry in entries.values_mut() {
            if !entry.is_resolved() && entry.failed_at < auto_resolve_cutoff {
                entry.resolved_at = Some(now);
                entry.resolved_by = Some("system".to_string());
                entry.resolution_notes = Some(format!(
                    "Auto-resolved after {} days",
                    config.auto_resolve_after_days
                ));
                auto_resolved += 1;
            }
        }

        if deleted_resolved > 0 || auto_resolved > 0 {
            tracing::info!(
                "DLQ cleanup: deleted {} resolved entries, auto-resolved {}",
                deleted_resolved,
                auto_resolved
            );
        }

        Ok(DlqCleanupReport {
            deleted_resolved,
            auto_resolved,
        })
    }
}

/// Alert severities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// An operator alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Pluggable alert delivery; fire-and-forget
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: Alert);
}

/// Default sink that writes alerts to the log
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Critical => tracing::error!("ALERT [{}]: {}", alert.title, alert.message),
            AlertSeverity::Warning => tracing::warn!("ALERT [{}]: {}", alert.title, alert.message),
            AlertSeverity::Info => tracing::info!("ALERT [{}]: {}", alert.title, alert.message),
        }
    }
}

/// Processes new DLQ entries: analysis, similar-error counting, alerting
pub struct DlqHandler {
    store: Arc<dyn DlqStore>,
    analyzer: DlqAnalyzer,
    alert_sink: Arc<dyn AlertSink>,
    config: DlqConfig,
}

impl DlqHandler {
    pub fn new(store: Arc<dyn DlqStore>, alert_sink: Arc<dyn AlertSink>, config: DlqConfig) -> Self {
        Self {
            store,
            analyzer: DlqAnalyzer::new(),
            alert_sink,
            config,
        }
    }

    pub fn store(&self) -> Arc<dyn DlqStore> {
        self.store.clone()
    }

    /// Insert an entry, analyze it, and raise alerts when warranted.
    pub async fn process_entry(&self, mut entry: DlqEntry) -> Result<ErrorAnalysis, DlqError> {
        let job_id = entry.original_job_id;
        let similar = self
            .store
            .count_similar(entry.kind, Utc::now() - ChronoDuration::hours(24))
            .await?;

        let analysis = self.analyzer.analyze(&entry, similar);
        entry.analysis = Some(analysis.clone());
        self.store.insert(entry.clone()).await?;
        self.store.set_analysis(job_id, analysis.clone()).await?;

        if self.config.alerts_enabled {
            self.send_alert_if_needed(&entry, &analysis, similar).await?;
        }

        tracing::info!(
            "Processed DLQ entry {}: {:?} ({:?})",
            job_id,
            analysis.category,
            analysis.severity
        );
        Ok(analysis)
    }

    async fn send_alert_if_needed(
        &self,
        entry: &DlqEntry,
        analysis: &ErrorAnalysis,
        similar: usize,
    ) -> Result<(), DlqError> {
        let open = self.store.open_count().await?;

        let (should_alert, severity, reason) = if analysis.is_critical {
            (true, AlertSeverity::Critical, format!("Critical error: {}", entry.error_code))
        } else if similar + 1 >= 5 {
            (
                true,
                AlertSeverity::Warning,
                format!("Repeated error: {} occurrences of {}", similar + 1, entry.error_code),
            )
        } else if open >= self.config.alert_threshold {
            (
                true,
                AlertSeverity::Warning,
                format!("DLQ size exceeded threshold: {} open entries", open),
            )
        } else {
            (false, AlertSeverity::Info, String::new())
        };

        if should_alert {
            let mut metadata = HashMap::new();
            metadata.insert("job_id".to_string(), serde_json::json!(entry.original_job_id));
            metadata.insert("project_id".to_string(), serde_json::json!(entry.project_id));
            metadata.insert("error_code".to_string(), serde_json::json!(entry.error_code));
            metadata.insert("similar_count".to_string(), serde_json::json!(similar));

            self.alert_sink
                .send(Alert {
                    title: format!("Ingestion DLQ alert: {}", entry.error_code),
                    message: format!(
                        "{}\n\nJob: {}\nProject: {}\nError: {}\nRecommendation: {}",
                        reason,
                        entry.original_job_id,
                        entry.project_id,
                        entry.error_message,
                        analysis.recommendation
                    ),
                    severity,
                    metadata,
                })
                .await;
        }
        Ok(())
    }

    /// Trend report over the trailing `days`.
    pub async fn report(&self, days: i64) -> Result<DlqTrendReport, DlqError> {
        let entries = self
            .store
            .entries_since(Utc::now() - ChronoDuration::days(days))
            .await?;
        let open = self.store.open_count().await?;
        Ok(self.analyzer.trend_report(&entries, days, open, self.config.alert_threshold))
    }
}

/// Spawn the scheduled cleanup task. Stops when `shutdown` is notified.
pub fn start_cleanup_task(
    store: Arc<dyn DlqStore>,
    config: DlqConfig,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(config.cleanup_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = store.cleanup(&config).await {
                        tracing::error!("DLQ cleanup failed: {}", e);
                    }
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }
    })
}
