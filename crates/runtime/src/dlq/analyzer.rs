//! Failure analysis for dead-letter entries
//!
//! Categorises failures by keyword, grades severity, recommends actions, and
//! rolls entries up into trend reports for operators.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DlqEntry;

/// Message fragments that mark a failure as critical
const CRITICAL_PATTERNS: &[&str] = &[
    "corruption",
    "security",
    "authentication",
    "authorization",
    "injection",
    "overflow",
];

/// Message fragments that mark a failure as likely transient
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "rate limit",
    "service unavailable",
    "temporary",
];

/// Broad failure categories used for triage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    FileHandling,
    ContentExtraction,
    EmbeddingApi,
    VectorStorage,
    SystemResource,
    Unknown,
}

/// Failure severity grades
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Computed analysis attached to a DLQ entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub is_transient: bool,
    pub is_critical: bool,
    pub retry_recommended: bool,
    pub actions_required: Vec<String>,
    pub recommendation: String,
    pub similar_errors_24h: usize,
}

/// Rolled-up view of recent failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqTrendReport {
    pub total_entries: usize,
    pub by_kind: HashMap<String, usize>,
    pub by_project: HashMap<String, usize>,
    pub by_day: HashMap<String, usize>,
    pub top_kinds: Vec<(String, usize)>,
    pub failing_projects: Vec<(String, usize)>,
    pub recommendations: Vec<String>,
    pub analysis_period_days: i64,
    pub critical_errors: usize,
    pub transient_errors: usize,
    pub current_open: usize,
    pub alert_threshold_exceeded: bool,
    pub generated_at: DateTime<Utc>,
}

/// Analyzes DLQ entries for patterns and recommendations
pub struct DlqAnalyzer;

impl DlqAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, entry: &DlqEntry, similar_errors_24h: usize) -> ErrorAnalysis {
        let category = self.categorize(entry);
        let is_critical = self.is_critical(entry);
        let is_transient = self.is_transient(entry);
        let severity = if is_critical {
            Severity::Critical
        } else if entry.attempts >= 3 {
            Severity::High
        } else if is_transient {
            Severity::Low
        } else {
            Severity::Medium
        };

        let retry_recommended = entry.attempts < 5 && !is_critical && !entry.kind.is_validation();
        let actions_required = self.required_actions(entry, is_critical);
        let recommendation =
            self.recommendation(entry, category, is_critical, retry_recommended, &actions_required);

        ErrorAnalysis {
            category,
            severity,
            is_transient,
            is_critical,
            retry_recommended,
            actions_required,
            recommendation,
            similar_errors_24h,
        }
    }

    fn error_text(entry: &DlqEntry) -> String {
        format!("{} {}", entry.error_code, entry.error_message).to_lowercase()
    }

    fn categorize(&self, entry: &DlqEntry) -> ErrorCategory {
        let text = Self::error_text(entry);
        let matches = |patterns: &[&str]| patterns.iter().any(|p| text.contains(p));

        if matches(&["file", "upload", "storage"]) {
            ErrorCategory::FileHandling
        } else if matches(&["extract", "parse", "ocr"]) {
            ErrorCategory::ContentExtraction
        } else if matches(&["embed", "api", "rate"]) {
            ErrorCategory::EmbeddingApi
        } else if matches(&["vector", "index", "collection"]) {
            ErrorCategory::VectorStorage
        } else if matches(&["timeout", "memory", "resource", "disk"]) {
            ErrorCategory::SystemResource
        } else {
            ErrorCategory::Unknown
        }
    }

    fn is_critical(&self, entry: &DlqEntry) -> bool {
        let text = Self::error_text(entry);
        CRITICAL_PATTERNS.iter().any(|p| text.contains(p))
    }

    fn is_transient(&self, entry: &DlqEntry) -> bool {
        let text = Self::error_text(entry);
        TRANSIENT_PATTERNS.iter().any(|p| text.contains(p))
    }

    fn required_actions(&self, entry: &DlqEntry, is_critical: bool) -> Vec<String> {
        let mut actions = Vec::new();
        if is_critical {
            actions.push("security_review".to_string());
        }
        match entry.kind {
            crate::types::ErrorKind::FileNotFound => actions.push("verify_file_exists".to_string()),
            crate::types::ErrorKind::InvalidFileType => actions.push("check_file_format".to_string()),
            crate::types::ErrorKind::EmbeddingRateLimited | crate::types::ErrorKind::EmbeddingQuotaExceeded => {
                actions.push("check_api_quota".to_string())
            }
            crate::types::ErrorKind::VectorStoreConnection | crate::types::ErrorKind::VectorStoreWrite => {
                actions.push("check_vector_store_health".to_string())
            }
            _ => {}
        }
        if entry.attempts >= 3 {
            actions.push("manual_investigation".to_string());
        }
        actions
    }

    fn recommendation(
        &self,
        entry: &DlqEntry,
        category: ErrorCategory,
        is_critical: bool,
        retry_recommended: bool,
        actions: &[String],
    ) -> String {
        if is_critical {
            return format!(
                "CRITICAL: {} requires immediate attention. Security review needed.",
                entry.error_code
            );
        }
        if retry_recommended && !actions.is_empty() {
            return format!("Transient error. Retry after addressing: {}", actions.join(", "));
        }
        match category {
            ErrorCategory::FileHandling => {
                "File handling issue. Verify the file exists and is accessible.".to_string()
            }
            ErrorCategory::ContentExtraction => {
                "Content extraction failed. Check file format and integrity.".to_string()
            }
            ErrorCategory::EmbeddingApi => {
                "Embedding API issue. Check quota, rate limits, and service status.".to_string()
            }
            ErrorCategory::VectorStorage => {
                "Vector store issue. Check backend health and connectivity.".to_string()
            }
            ErrorCategory::SystemResource => {
                "System resource issue. Check memory, CPU, and disk usage.".to_string()
            }
            ErrorCategory::Unknown => format!(
                "Unknown error pattern. Manual investigation required for {}.",
                entry.error_code
            ),
        }
    }

    /// Roll entries up by kind, project, and day, and derive rule-based
    /// recommendations.
    pub fn trend_report(
        &self,
        entries: &[DlqEntry],
        days: i64,
        current_open: usize,
        alert_threshold: usize,
    ) -> DlqTrendReport {
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut by_project: HashMap<String, usize> = HashMap::new();
        let mut by_day: HashMap<String, usize> = HashMap::new();
        let mut critical_errors = 0;
        let mut transient_errors = 0;

        for entry in entries {
            *by_kind.entry(entry.error_code.clone()).or_default() += 1;
            *by_project.entry(entry.project_id.clone()).or_default() += 1;
            *by_day.entry(entry.failed_at.format("%Y-%m-%d").to_string()).or_default() += 1;
            if self.is_critical(entry) {
                critical_errors += 1;
            }
            if self.is_transient(entry) {
                transient_errors += 1;
            }
        }

        let mut top_kinds: Vec<(String, usize)> =
            by_kind.iter().map(|(k, v)| (k.clone(), *v)).collect();
        top_kinds.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top_kinds.truncate(10);

        let mut failing_projects: Vec<(String, usize)> =
            by_project.iter().map(|(k, v)| (k.clone(), *v)).collect();
        failing_projects.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        failing_projects.truncate(5);

        let mut recommendations = Vec::new();
        if let Some((kind, count)) = top_kinds.first() {
            if *count > 5 {
                recommendations.push(format!(
                    "Address recurring {} errors ({} occurrences)",
                    kind, count
                ));
            }
        }
        for (project, count) in &failing_projects {
            if *count > 3 {
                recommendations.push(format!(
                    "Project {} has {} failures - investigate project-specific issues",
                    project, count
                ));
            }
        }
        if by_day.len() > 1 {
            let counts: Vec<usize> = by_day.values().copied().collect();
            let mean = counts.iter().sum::<usize>() as f64 / counts.len() as f64;
            if let Some(max) = counts.iter().max() {
                if *max as f64 > 2.0 * mean {
                    recommendations.push(
                        "Spike in failures detected - check for system issues during peak times"
                            .to_string(),
                    );
                }
            }
        }

        DlqTrendReport {
            total_entries: entries.len(),
            by_kind,
            by_project,
            by_day,
            top_kinds,
            failing_projects,
            recommendations,
            analysis_period_days: days,
            critical_errors,
            transient_errors,
            current_open,
            alert_threshold_exceeded: current_open >= alert_threshold,
            generated_at: Utc::now(),
        }
    }
}

impl Default for DlqAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::tests::entry;
    use crate::types::ErrorKind;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_category_embedding_api() {
        let analyzer = DlqAnalyzer::new();
        let e = entry(ErrorKind::EmbeddingRateLimited, 2);
        let analysis = analyzer.analyze(&e, 0);
        assert_eq!(analysis.category, ErrorCategory::EmbeddingApi);
    }

    #[test]
    fn test_category_file_handling() {
        let analyzer = DlqAnalyzer::new();
        let mut e = entry(ErrorKind::FileCorrupted, 1);
        e.error_message = "file is corrupted".to_string();
        let analysis = analyzer.analyze(&e, 0);
        assert_eq!(analysis.category, ErrorCategory::FileHandling);
    }

    #[test]
    fn test_severity_ladder() {
        let analyzer = DlqAnalyzer::new();

        // Critical keyword wins
        let mut critical = entry(ErrorKind::IndexCorruption, 1);
        critical.error_message = "index corruption detected".to_string();
        assert_eq!(analyzer.analyze(&critical, 0).severity, Severity::Critical);

        // High when attempts pile up
        let exhausted = entry(ErrorKind::ExtractionFailed, 4);
        assert_eq!(analyzer.analyze(&exhausted, 0).severity, Severity::High);

        // Low for transient errors
        let mut transient = entry(ErrorKind::NetworkError, 1);
        transient.error_message = "connection reset".to_string();
        assert_eq!(analyzer.analyze(&transient, 0).severity, Severity::Low);

        // Medium otherwise
        let mut plain = entry(ErrorKind::FileCorrupted, 1);
        plain.error_message = "PDF contains JavaScript".to_string();
        assert_eq!(analyzer.analyze(&plain, 0).severity, Severity::Medium);
    }

    #[test]
    fn test_retry_recommendation_rules() {
        let analyzer = DlqAnalyzer::new();

        // Validation kinds never recommended
        let validation = entry(ErrorKind::InvalidFileType, 1);
        assert!(!analyzer.analyze(&validation, 0).retry_recommended);

        // Too many attempts
        let exhausted = entry(ErrorKind::ExtractionFailed, 5);
        assert!(!analyzer.analyze(&exhausted, 0).retry_recommended);

        // Critical never recommended
        let mut critical = entry(ErrorKind::Unknown, 1);
        critical.error_message = "sql injection attempt".to_string();
        assert!(!analyzer.analyze(&critical, 0).retry_recommended);

        // Plain transient failure is recommended
        let transient = entry(ErrorKind::EmbeddingApiError, 2);
        assert!(analyzer.analyze(&transient, 0).retry_recommended);
    }

    #[test]
    fn test_required_actions() {
        let analyzer = DlqAnalyzer::new();
        let e = entry(ErrorKind::EmbeddingRateLimited, 3);
        let analysis = analyzer.analyze(&e, 0);
        assert!(analysis.actions_required.contains(&"check_api_quota".to_string()));
        assert!(analysis.actions_required.contains(&"manual_investigation".to_string()));
    }

    #[test]
    fn test_trend_report_top_kinds_and_recommendations() {
        let analyzer = DlqAnalyzer::new();
        let mut entries = Vec::new();
        for _ in 0..7 {
            entries.push(entry(ErrorKind::EmbeddingApiError, 2));
        }
        for _ in 0..2 {
            entries.push(entry(ErrorKind::FileNotFound, 1));
        }

        let report = analyzer.trend_report(&entries, 7, 3, 10);
        assert_eq!(report.total_entries, 9);
        assert_eq!(report.top_kinds[0].0, "embedding_api_error");
        assert_eq!(report.top_kinds[0].1, 7);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("embedding_api_error")));
        assert!(!report.alert_threshold_exceeded);
    }

    #[test]
    fn test_trend_report_project_and_spike_rules() {
        let analyzer = DlqAnalyzer::new();
        let mut entries = Vec::new();
        // Five failures today, one each on two earlier days: a clear spike
        for i in 0..7 {
            let mut e = entry(ErrorKind::ChunkingError, 1);
            e.project_id = "project-noisy".to_string();
            e.failed_at = match i {
                0..=4 => Utc::now(),
                5 => Utc::now() - ChronoDuration::days(2),
                _ => Utc::now() - ChronoDuration::days(3),
            };
            entries.push(e);
        }

        let report = analyzer.trend_report(&entries, 7, 12, 10);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("project-noisy")));
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("Spike in failures")));
        assert!(report.alert_threshold_exceeded);
    }
}
