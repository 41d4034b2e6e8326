//! Configuration for the ingestion runtime
//!
//! Every setting has a secure default and can be overridden through
//! environment variables.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("could not parse {:?}", raw),
        }),
        Err(_) => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Queue driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub url: String,
    pub namespace: String,
    pub dlq_namespace: String,
    pub visibility_timeout: Duration,
    pub promotion_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "mem://local".to_string(),
            namespace: "ingest".to_string(),
            dlq_namespace: "ingest-dlq".to_string(),
            visibility_timeout: Duration::from_secs(600),
            promotion_interval: Duration::from_millis(500),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            url: env_string("QUEUE_URL", &defaults.url),
            namespace: env_string("QUEUE_NAMESPACE", &defaults.namespace),
            dlq_namespace: env_string("DLQ_NAMESPACE", &defaults.dlq_namespace),
            ..defaults
        })
    }
}

/// Worker and pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub embed_version: String,
    pub worker_timeout: Duration,
    pub chunk_timeout: Duration,
    pub max_retries: u32,
    pub embedding_batch_size: usize,
    pub batch_pacing: Duration,
    /// Extracted text shorter than this falls back to OCR.
    pub ocr_text_threshold: usize,
    pub ocr_confidence_warning: f32,
    pub cancel_check_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            embed_version: "v1.0".to_string(),
            worker_timeout: Duration::from_secs(3600),
            chunk_timeout: Duration::from_secs(300),
            max_retries: 4,
            embedding_batch_size: 32,
            batch_pacing: Duration::from_millis(100),
            ocr_text_threshold: 50,
            ocr_confidence_warning: 0.7,
            cancel_check_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            embed_version: env_string("EMBED_VERSION", &defaults.embed_version),
            worker_timeout: Duration::from_secs(env_parse(
                "WORKER_TIMEOUT",
                defaults.worker_timeout.as_secs(),
            )?),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries)?,
            embedding_batch_size: env_parse("EMBEDDING_BATCH_SIZE", defaults.embedding_batch_size)?,
            ..defaults
        })
    }
}

/// File security validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub max_file_size_mb: u64,
    pub max_pdf_pages: usize,
    pub allowed_file_types: Vec<String>,
    pub temp_file_ttl: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 30,
            max_pdf_pages: 500,
            allowed_file_types: ["pdf", "txt", "md", "doc", "docx"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            temp_file_ttl: Duration::from_secs(2 * 3600),
        }
    }
}

impl SecurityConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let allowed = env::var("ALLOWED_FILE_TYPES")
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or(defaults.allowed_file_types.clone());
        Ok(Self {
            max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", defaults.max_file_size_mb)?,
            max_pdf_pages: env_parse("MAX_PAGES_PDF", defaults.max_pdf_pages)?,
            allowed_file_types: allowed,
            temp_file_ttl: Duration::from_secs(
                env_parse("TEMP_FILE_TTL_HOURS", defaults.temp_file_ttl.as_secs() / 3600)? * 3600,
            ),
        })
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// Process resource limits enforced between pipeline stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub max_memory_mb: u64,
    pub max_cpu_time: Duration,
    pub max_open_files: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_cpu_time: Duration::from_secs(300),
            max_open_files: 50,
        }
    }
}

impl ResourceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_memory_mb: env_parse("MAX_MEMORY_MB", defaults.max_memory_mb)?,
            max_cpu_time: Duration::from_secs(env_parse(
                "MAX_CPU_TIME",
                defaults.max_cpu_time.as_secs(),
            )?),
            max_open_files: env_parse("MAX_OPEN_FILES", defaults.max_open_files)?,
        })
    }
}

/// Embedding rate limiting and concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_tokens_per_window: u64,
    pub embedding_concurrency: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_tokens_per_window: 1000,
            embedding_concurrency: 3,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            window: defaults.window,
            max_tokens_per_window: env_parse(
                "EMBEDDING_RATE_LIMIT",
                defaults.max_tokens_per_window,
            )?,
            embedding_concurrency: env_parse(
                "EMBEDDING_CONCURRENCY",
                defaults.embedding_concurrency,
            )?,
        })
    }
}

/// Dead-letter queue retention and alerting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    pub retention_days: i64,
    pub auto_resolve_after_days: i64,
    pub alert_threshold: usize,
    pub cleanup_interval: Duration,
    pub alerts_enabled: bool,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            auto_resolve_after_days: 7,
            alert_threshold: 10,
            cleanup_interval: Duration::from_secs(3600),
            alerts_enabled: true,
        }
    }
}

impl DlqConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            retention_days: env_parse("DLQ_RETENTION_DAYS", defaults.retention_days)?,
            auto_resolve_after_days: env_parse(
                "DLQ_AUTO_RESOLVE_AFTER_DAYS",
                defaults.auto_resolve_after_days,
            )?,
            alert_threshold: env_parse("DLQ_ALERT_THRESHOLD", defaults.alert_threshold)?,
            ..defaults
        })
    }
}

/// Vector store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub qdrant_url: String,
    pub collection_name: String,
    pub vector_dimension: usize,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            qdrant_url: "http://localhost:6334".to_string(),
            collection_name: "ingest_documents".to_string(),
            vector_dimension: 1536,
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl VectorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            qdrant_url: env_string("QDRANT_URL", &defaults.qdrant_url),
            collection_name: env_string("QDRANT_COLLECTION", &defaults.collection_name),
            api_key: env::var("QDRANT_API_KEY").ok(),
            ..defaults
        })
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: env_string("BIND_ADDR", &Self::default().bind_addr),
        })
    }
}

/// Aggregate runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub security: SecurityConfig,
    pub resources: ResourceConfig,
    pub rate_limit: RateLimitConfig,
    pub dlq: DlqConfig,
    pub vector: VectorConfig,
    pub api: ApiConfig,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            queue: QueueConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
            security: SecurityConfig::from_env()?,
            resources: ResourceConfig::from_env()?,
            rate_limit: RateLimitConfig::from_env()?,
            dlq: DlqConfig::from_env()?,
            vector: VectorConfig::from_env()?,
            api: ApiConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.security.max_file_size_mb, 30);
        assert_eq!(config.security.max_pdf_pages, 500);
        assert_eq!(config.worker.embedding_batch_size, 32);
        assert_eq!(config.rate_limit.max_tokens_per_window, 1000);
        assert_eq!(config.rate_limit.embedding_concurrency, 3);
        assert_eq!(config.dlq.retention_days, 30);
        assert_eq!(config.dlq.auto_resolve_after_days, 7);
        assert_eq!(config.worker.worker_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_size_limit_in_bytes() {
        let config = SecurityConfig::default();
        assert_eq!(config.max_file_size_bytes(), 30 * 1024 * 1024);
    }
}
