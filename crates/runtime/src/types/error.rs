//! Error taxonomy and retry policies for the ingestion pipeline

use serde::{Deserialize, Serialize};

/// Every failure the pipeline can surface, with a stable wire code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Validation
    #[error("unsupported file type")]
    InvalidFileType,
    #[error("file exceeds the configured size limit")]
    FileTooLarge,
    #[error("unknown or invalid project")]
    InvalidProject,
    #[error("duplicate ingest id")]
    DuplicateIngest,

    // File access
    #[error("file not found")]
    FileNotFound,
    #[error("file is corrupted")]
    FileCorrupted,
    #[error("file is locked by another process")]
    FileLocked,
    #[error("file storage unavailable")]
    StorageUnavailable,

    // Processing
    #[error("text extraction failed")]
    ExtractionFailed,
    #[error("OCR engine error")]
    OcrEngineError,
    #[error("OCR confidence below threshold")]
    OcrLowConfidence,
    #[error("chunking failed")]
    ChunkingError,

    // Embedding
    #[error("embedding API error")]
    EmbeddingApiError,
    #[error("embedding rate limit exceeded")]
    EmbeddingRateLimited,
    #[error("embedding quota exceeded")]
    EmbeddingQuotaExceeded,
    #[error("embedding model unavailable")]
    EmbeddingModelUnavailable,

    // Vector storage
    #[error("vector store connection error")]
    VectorStoreConnection,
    #[error("vector store write error")]
    VectorStoreWrite,
    #[error("vector index corruption")]
    IndexCorruption,

    // System
    #[error("worker timeout")]
    WorkerTimeout,
    #[error("memory limit exhausted")]
    MemoryExhausted,
    #[error("disk full")]
    DiskFull,
    #[error("network error")]
    NetworkError,

    // Cancellation
    #[error("canceled by user")]
    UserCanceled,
    #[error("canceled by system")]
    SystemCanceled,

    #[error("unknown error")]
    Unknown,
}

impl ErrorKind {
    /// Every kind, for code lookups.
    pub const ALL: &'static [ErrorKind] = &[
        ErrorKind::InvalidFileType,
        ErrorKind::FileTooLarge,
        ErrorKind::InvalidProject,
        ErrorKind::DuplicateIngest,
        ErrorKind::FileNotFound,
        ErrorKind::FileCorrupted,
        ErrorKind::FileLocked,
        ErrorKind::StorageUnavailable,
        ErrorKind::ExtractionFailed,
        ErrorKind::OcrEngineError,
        ErrorKind::OcrLowConfidence,
        ErrorKind::ChunkingError,
        ErrorKind::EmbeddingApiError,
        ErrorKind::EmbeddingRateLimited,
        ErrorKind::EmbeddingQuotaExceeded,
        ErrorKind::EmbeddingModelUnavailable,
        ErrorKind::VectorStoreConnection,
        ErrorKind::VectorStoreWrite,
        ErrorKind::IndexCorruption,
        ErrorKind::WorkerTimeout,
        ErrorKind::MemoryExhausted,
        ErrorKind::DiskFull,
        ErrorKind::NetworkError,
        ErrorKind::UserCanceled,
        ErrorKind::SystemCanceled,
        ErrorKind::Unknown,
    ];

    /// Inverse of [`ErrorKind::code`].
    pub fn from_code(code: &str) -> Option<ErrorKind> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }

    /// Stable string code used in API responses and DLQ records.
    pub fn code(&self) -> &'static str {
        use ErrorKind::*;
        match self {
            InvalidFileType => "invalid_file_type",
            FileTooLarge => "file_too_large",
            InvalidProject => "invalid_project",
            DuplicateIngest => "duplicate_ingest",
            FileNotFound => "file_not_found",
            FileCorrupted => "file_corrupted",
            FileLocked => "file_locked",
            StorageUnavailable => "storage_unavailable",
            ExtractionFailed => "extraction_failed",
            OcrEngineError => "ocr_engine_error",
            OcrLowConfidence => "ocr_confidence_low",
            ChunkingError => "chunking_error",
            EmbeddingApiError => "embedding_api_error",
            EmbeddingRateLimited => "embedding_rate_limited",
            EmbeddingQuotaExceeded => "embedding_quota_exceeded",
            EmbeddingModelUnavailable => "embedding_model_unavailable",
            VectorStoreConnection => "vector_store_connection_error",
            VectorStoreWrite => "vector_store_write_error",
            IndexCorruption => "index_corruption",
            WorkerTimeout => "worker_timeout",
            MemoryExhausted => "memory_exhausted",
            DiskFull => "disk_full",
            NetworkError => "network_error",
            UserCanceled => "user_canceled",
            SystemCanceled => "system_canceled",
            Unknown => "unknown_error",
        }
    }

    /// Retry policy for this failure kind. Unmapped kinds back off
    /// exponentially.
    pub fn retry_policy(&self) -> RetryPolicy {
        use ErrorKind::*;
        match self {
            InvalidFileType | FileTooLarge | InvalidProject | DuplicateIngest | WorkerTimeout
            | MemoryExhausted | DiskFull | UserCanceled | SystemCanceled => RetryPolicy::NoRetry,
            FileLocked => RetryPolicy::Immediate,
            StorageUnavailable | ChunkingError | VectorStoreConnection | VectorStoreWrite => {
                RetryPolicy::Linear
            }
            ExtractionFailed | OcrEngineError | EmbeddingApiError => RetryPolicy::Exponential,
            EmbeddingRateLimited => RetryPolicy::DelayedFixed,
            _ => RetryPolicy::Exponential,
        }
    }

    /// Validation kinds never earn a retry recommendation from the analyzer.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidFileType
                | ErrorKind::FileTooLarge
                | ErrorKind::InvalidProject
                | ErrorKind::DuplicateIngest
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ErrorKind::UserCanceled | ErrorKind::SystemCanceled)
    }

    /// Best-effort classification of a collaborator failure by message text.
    /// Used when a stage surfaces an untyped error.
    pub fn classify_message(message: &str) -> ErrorKind {
        let text = message.to_lowercase();
        if text.contains("file not found") || text.contains("no such file") {
            ErrorKind::FileNotFound
        } else if text.contains("file too large") {
            ErrorKind::FileTooLarge
        } else if text.contains("unsupported file type") || text.contains("invalid file type") {
            ErrorKind::InvalidFileType
        } else if text.contains("invalid project") {
            ErrorKind::InvalidProject
        } else if text.contains("rate limit") {
            ErrorKind::EmbeddingRateLimited
        } else if text.contains("quota") {
            ErrorKind::EmbeddingQuotaExceeded
        } else if text.contains("ocr") {
            ErrorKind::OcrEngineError
        } else if text.contains("extract") || text.contains("no text content") {
            ErrorKind::ExtractionFailed
        } else if text.contains("chunk") {
            ErrorKind::ChunkingError
        } else if text.contains("embed") {
            ErrorKind::EmbeddingApiError
        } else if text.contains("vector") || text.contains("index") {
            ErrorKind::VectorStoreConnection
        } else if text.contains("timeout") {
            ErrorKind::WorkerTimeout
        } else if text.contains("network") || text.contains("connection") {
            ErrorKind::NetworkError
        } else {
            ErrorKind::Unknown
        }
    }
}

/// Backoff families for failed jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    NoRetry,
    Immediate,
    Linear,
    Exponential,
    DelayedFixed,
}

impl RetryPolicy {
    /// Maximum attempts granted by this policy, not counting the first run.
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::NoRetry => 0,
            RetryPolicy::Immediate => 3,
            RetryPolicy::Linear => 4,
            RetryPolicy::Exponential => 4,
            RetryPolicy::DelayedFixed => 3,
        }
    }

    /// Delay in seconds before retry number `attempt` (1-based).
    pub fn retry_delay_seconds(&self, attempt: u32) -> u64 {
        const BASE: u64 = 1;
        const EXP_CAP: u64 = 125;
        const FIXED_DELAY: u64 = 30;
        match self {
            RetryPolicy::NoRetry | RetryPolicy::Immediate => 0,
            RetryPolicy::Linear => BASE * u64::from(attempt),
            RetryPolicy::Exponential => {
                let exp = attempt.saturating_sub(1).min(8);
                (BASE * 5u64.saturating_pow(exp)).min(EXP_CAP)
            }
            RetryPolicy::DelayedFixed => FIXED_DELAY,
        }
    }
}

/// Whether a failure with `kind` on retry number `attempt` should be retried.
pub fn should_retry(kind: ErrorKind, attempt: u32) -> bool {
    let policy = kind.retry_policy();
    policy != RetryPolicy::NoRetry && attempt < policy.max_retries()
}
