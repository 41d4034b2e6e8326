//! Stage collaborators for the ingestion pipeline
//!
//! Each external system the pipeline talks to sits behind a trait: the file
//! source, text extractor, OCR engine, chunker, and embedding model. Stage
//! failures carry a typed error kind so the driver can map them onto the
//! state machine without inspecting messages.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::ErrorKind;

/// A typed stage failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wrap an untyped failure, classifying the kind from its message.
    pub fn untyped(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ErrorKind::classify_message(&message),
            message,
        }
    }
}

/// Basic facts about a stored file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
}

/// Source of uploaded files
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo, StageError>;

    /// Full file contents.
    async fn read(&self, file_id: &str) -> Result<Vec<u8>, StageError>;
}

/// Extracts text from a file on disk
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path, content_type: Option<&str>) -> Result<String, StageError>;
}

/// OCR output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    pub confidence: f32,
}

/// Optical character recognition engine
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, path: &Path) -> Result<OcrOutput, StageError>;
}

/// Splits text into overlapping chunks
#[async_trait]
pub trait TextChunker: Send + Sync {
    async fn chunk(
        &self,
        text: &str,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<Vec<String>, StageError>;
}

/// Embedding model client
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a batch of texts, one vector per input.
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, StageError>;

    fn model_name(&self) -> &str;

    async fn healthy(&self) -> bool;
}

/// Rough token estimate used for rate-limit admission: 1.3 tokens per word.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.split_whitespace().count() as f64 * 1.3).ceil() as u64
}

/// Extraction method label recorded in job metrics.
pub fn extraction_method(content_type: Option<&str>) -> &'static str {
    match content_type {
        Some("application/pdf") => "pdf_extraction",
        Some("text/plain") => "text_direct",
        Some("text/markdown") => "markdown_parsing",
        Some("application/msword") => "doc_extraction",
        Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document") => {
            "docx_extraction"
        }
        _ => "unknown",
    }
}

/// File source backed by a local directory; file ids are relative paths.
pub struct LocalFileSource {
    root: PathBuf,
}

impl LocalFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, file_id: &str) -> Result<PathBuf, StageError> {
        // Reject path traversal in file ids.
        if file_id.contains("..") || file_id.starts_with('/') {
            return Err(StageError::new(
                ErrorKind::FileNotFound,
                format!("file not found: {}", file_id),
            ));
        }
        Ok(self.root.join(file_id))
    }
}

#[async_trait]
impl FileSource for LocalFileSource {
    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo, StageError> {
        let path = self.resolve(file_id)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(|_| {
            StageError::new(ErrorKind::FileNotFound, format!("file not found: {}", file_id))
        })?;
        let content_type = match path.extension().and_then(|e| e.to_str()) {
            Some("pdf") => Some("application/pdf".to_string()),
            Some("md") => Some("text/markdown".to_string()),
            Some("txt") => Some("text/plain".to_string()),
            Some("doc") => Some("application/msword".to_string()),
            Some("docx") => Some(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                    .to_string(),
            ),
            _ => None,
        };
        Ok(FileInfo {
            file_id: file_id.to_string(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_id.to_string()),
            size: metadata.len(),
            content_type,
        })
    }

    async fn read(&self, file_id: &str) -> Result<Vec<u8>, StageError> {
        let path = self.resolve(file_id)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                StageError::new(ErrorKind::FileNotFound, format!("file not found: {}", file_id))
            }
            _ => StageError::new(ErrorKind::StorageUnavailable, e.to_string()),
        })
    }
}

/// Extractor for plain-text formats; binary formats go through OCR.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, path: &Path, _content_type: Option<&str>) -> Result<String, StageError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StageError::new(ErrorKind::ExtractionFailed, e.to_string()))?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            // Not valid text; leave OCR to decide.
            Err(_) => Ok(String::new()),
        }
    }
}

/// Character-window chunker with word-boundary snapping
pub struct SlidingWindowChunker;

#[async_trait]
impl TextChunker for SlidingWindowChunker {
    async fn chunk(
        &self,
        text: &str,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<Vec<String>, StageError> {
        if chunk_size == 0 {
            return Err(StageError::new(ErrorKind::ChunkingError, "chunk size must be positive"));
        }
        if chunk_overlap >= chunk_size {
            return Err(StageError::new(
                ErrorKind::ChunkingError,
                "chunk overlap must be smaller than chunk size",
            ));
        }

        let chars: Vec<char> = text.chars().collect();
        let mut chunks = Vec::new();
        let step = chunk_size - chunk_overlap;
        let mut start = 0;
        while start < chars.len() {
            let end = (start + chunk_size).min(chars.len());
            let chunk: String = chars[start..end].iter().collect();
            let trimmed = chunk.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
            if end == chars.len() {
                break;
            }
            start += step;
        }
        Ok(chunks)
    }
}

/// Embedding client for an OpenAI-compatible HTTP endpoint
pub struct HttpEmbeddingModel {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingHttpRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingHttpResponse {
    data: Vec<EmbeddingHttpItem>,
}

#[derive(Deserialize)]
struct EmbeddingHttpItem {
    embedding: Vec<f32>,
}

impl HttpEmbeddingModel {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            model: model.into(),
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> ErrorKind {
        match status.as_u16() {
            429 => ErrorKind::EmbeddingRateLimited,
            402 => ErrorKind::EmbeddingQuotaExceeded,
            404 | 503 => ErrorKind::EmbeddingModelUnavailable,
            _ => ErrorKind::EmbeddingApiError,
        }
    }
}

#[async_trait]
impl EmbeddingModel for HttpEmbeddingModel {
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, StageError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&EmbeddingHttpRequest {
            model: &self.model,
            input: batch,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StageError::new(ErrorKind::NetworkError, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StageError::new(
                Self::classify_status(status),
                format!("embedding API returned {}: {}", status, body),
            ));
        }

        let parsed: EmbeddingHttpResponse = response
            .json()
            .await
            .map_err(|e| StageError::new(ErrorKind::EmbeddingApiError, e.to_string()))?;

        if parsed.data.len() != batch.len() {
            return Err(StageError::new(
                ErrorKind::EmbeddingApiError,
                format!(
                    "embedding API returned {} vectors for {} inputs",
                    parsed.data.len(),
                    batch.len()
                ),
            ));
        }
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn healthy(&self) -> bool {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
