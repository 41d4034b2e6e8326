//! Document retriever with semantic, keyword, and hybrid search

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::stages::EmbeddingModel;
use crate::vector::{DocumentFilter, MetadataFilter, VectorStore, VectorStoreError};

/// Retrieval errors
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("invalid search request ({field}): {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    #[error("embedding failed: {reason}")]
    Embedding { reason: String },

    #[error(transparent)]
    Store(#[from] VectorStoreError),
}

/// Types of search operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Semantic,
    Keyword,
    Hybrid,
    MetadataFilter,
}

/// Request for document search
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub search_type: SearchType,
    pub max_results: usize,
    pub similarity_threshold: f32,
    pub metadata_filter: Option<MetadataFilter>,
    pub document_filter: Option<DocumentFilter>,
    pub project_id: Option<String>,
    pub document_type: Option<String>,
}

impl SearchRequest {
    pub fn semantic(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            search_type: SearchType::Semantic,
            max_results: 10,
            similarity_threshold: 0.7,
            metadata_filter: None,
            document_filter: None,
            project_id: None,
            document_type: None,
        }
    }
}

/// Individual search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub document_id: String,
    pub content: String,
    pub metadata: HashMap<String, Value>,
    pub similarity_score: f32,
    pub rank: usize,
}

/// Response from document search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub query: String,
    pub search_type: SearchType,
    pub total_results: usize,
    pub search_time_seconds: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMetrics {
    pub total_searches: u64,
    pub semantic_searches: u64,
    pub keyword_searches: u64,
    pub hybrid_searches: u64,
    pub avg_search_time: f64,
    pub avg_results_returned: f64,
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "is", "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should", "what", "where", "when", "how", "why", "who",
];

/// Document retriever over the vector store
pub struct DocumentRetriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingModel>,
    max_results_limit: usize,
    word_pattern: Regex,
    metrics: Mutex<SearchMetrics>,
}

impl DocumentRetriever {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            store,
            embedder,
            max_results_limit: 100,
            // Word pattern never fails to compile
            word_pattern: Regex::new(r"\b\w+\b").unwrap_or_else(|_| unreachable!()),
            metrics: Mutex::new(SearchMetrics::default()),
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, RetrievalError> {
        self.validate(&request)?;
        let started = Instant::now();

        let results = match request.search_type {
            SearchType::Semantic => self.semantic_search(&request).await?,
            SearchType::Keyword => self.keyword_search(&request).await?,
            SearchType::Hybrid => self.hybrid_search(&request).await?,
            SearchType::MetadataFilter => self.metadata_search(&request).await?,
        };

        let search_time = started.elapsed().as_secs_f64();
        self.record_metrics(request.search_type, search_time, results.len());

        tracing::debug!(
            "{:?} search for {:?} returned {} results in {:.3}s",
            request.search_type,
            request.query,
            results.len(),
            search_time
        );

        Ok(SearchResponse {
            total_results: results.len(),
            results,
            query: request.query,
            search_type: request.search_type,
            search_time_seconds: search_time,
        })
    }

    fn validate(&self, request: &SearchRequest) -> Result<(), RetrievalError> {
        if request.query.trim().is_empty() {
            return Err(RetrievalError::InvalidRequest {
                field: "query",
                reason: "search query cannot be empty".to_string(),
            });
        }
        if request.max_results == 0 {
            return Err(RetrievalError::InvalidRequest {
                field: "max_results",
                reason: "max_results must be positive".to_string(),
            });
        }
        if request.max_results > self.max_results_limit {
            return Err(RetrievalError::InvalidRequest {
                field: "max_results",
                reason: format!("max_results exceeds limit of {}", self.max_results_limit),
            });
        }
        if !(0.0..=1.0).contains(&request.similarity_threshold) {
            return Err(RetrievalError::InvalidRequest {
                field: "similarity_threshold",
                reason: "similarity_threshold must be between 0.0 and 1.0".to_string(),
            });
        }
        if request.search_type == SearchType::MetadataFilter
            && request.metadata_filter.is_none()
            && request.project_id.is_none()
            && request.document_type.is_none()
        {
            return Err(RetrievalError::InvalidRequest {
                field: "metadata_filter",
                reason: "metadata filters required for metadata_filter search".to_string(),
            });
        }
        Ok(())
    }

    /// Combine request-level filters into one metadata filter.
    fn build_metadata_filter(&self, request: &SearchRequest) -> Option<MetadataFilter> {
        let mut filter = request.metadata_filter.clone().unwrap_or_default();
        if let Some(project_id) = &request.project_id {
            filter = filter.eq("project_id", project_id.clone());
        }
        if let Some(document_type) = &request.document_type {
            filter = filter.eq("document_type", document_type.clone());
        }
        if filter.is_empty() {
            None
        } else {
            Some(filter)
        }
    }

    async fn semantic_search(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        self.semantic_search_with(request, request.max_results, request.similarity_threshold)
            .await
    }

    async fn semantic_search_with(
        &self,
        request: &SearchRequest,
        n_results: usize,
        threshold: f32,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        let embedding = self
            .embedder
            .embed(&[request.query.clone()])
            .await
            .map_err(|e| RetrievalError::Embedding { reason: e.to_string() })?
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::Embedding {
                reason: "embedding model returned no vector".to_string(),
            })?;

        let hits = self
            .store
            .search(
                embedding,
                n_results,
                self.build_metadata_filter(request),
                request.document_filter.clone(),
            )
            .await?;

        let mut results: Vec<SearchResult> = hits
            .iter()
            .filter(|hit| hit.similarity() >= threshold)
            .map(|hit| SearchResult {
                document_id: hit.id.clone(),
                content: hit.text.clone(),
                metadata: hit.metadata.clone(),
                similarity_score: hit.similarity().clamp(0.0, 1.0),
                rank: 0,
            })
            .collect();
        assign_ranks(&mut results);
        Ok(results)
    }

    async fn keyword_search(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        self.keyword_search_with(request, request.max_results).await
    }

    async fn keyword_search_with(
        &self,
        request: &SearchRequest,
        n_results: usize,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        let keywords = self.extract_keywords(&request.query);

        let mut contains = keywords.clone();
        if let Some(document_filter) = &request.document_filter {
            contains.extend(document_filter.contains_any.clone());
        }
        let document_filter = if contains.is_empty() {
            None
        } else {
            Some(DocumentFilter::contains_any(contains))
        };

        let records = self
            .store
            .get(self.build_metadata_filter(request), document_filter, n_results, 0)
            .await?;

        let mut results: Vec<SearchResult> = records
            .into_iter()
            .map(|record| {
                let score = keyword_score(&record.text, &keywords, &request.query);
                SearchResult {
                    document_id: record.id,
                    content: record.text,
                    metadata: record.metadata,
                    similarity_score: score,
                    rank: 0,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        assign_ranks(&mut results);
        Ok(results)
    }

    async fn hybrid_search(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        // Over-fetch both legs, then merge. The semantic leg runs at a lower
        // threshold so keyword hits are not starved of partners.
        let doubled = (request.max_results * 2).min(self.max_results_limit);
        let semantic = self
            .semantic_search_with(request, doubled, request.similarity_threshold * 0.8)
            .await?;
        let keyword = self.keyword_search_with(request, doubled).await?;

        const SEMANTIC_WEIGHT: f32 = 0.6;
        const KEYWORD_WEIGHT: f32 = 0.4;

        let mut merged: HashMap<String, (SearchResult, f32, f32)> = HashMap::new();
        for result in semantic {
            let score = result.similarity_score;
            merged.insert(result.document_id.clone(), (result, score, 0.0));
        }
        for result in keyword {
            match merged.get_mut(&result.document_id) {
                Some(entry) => entry.2 = result.similarity_score,
                None => {
                    let score = result.similarity_score;
                    merged.insert(result.document_id.clone(), (result, 0.0, score));
                }
            }
        }

        let mut results: Vec<SearchResult> = merged
            .into_values()
            .map(|(mut result, semantic_score, keyword_score)| {
                result.similarity_score =
                    (SEMANTIC_WEIGHT * semantic_score + KEYWORD_WEIGHT * keyword_score).clamp(0.0, 1.0);
                result
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(request.max_results);
        assign_ranks(&mut results);
        Ok(results)
    }

    async fn metadata_search(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        let records = self
            .store
            .get(self.build_metadata_filter(request), None, request.max_results, 0)
            .await?;

        let mut results: Vec<SearchResult> = records
            .into_iter()
            .map(|record| {
                let score = content_relevance(&record.text, &request.query);
                SearchResult {
                    document_id: record.id,
                    content: record.text,
                    metadata: record.metadata,
                    similarity_score: score,
                    rank: 0,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        assign_ranks(&mut results);
        Ok(results)
    }

    /// Lower-cased tokens longer than two characters, stop words removed.
    fn extract_keywords(&self, query: &str) -> Vec<String> {
        let lowered = query.to_lowercase();
        self.word_pattern
            .find_iter(&lowered)
            .map(|m| m.as_str().to_string())
            .filter(|word| word.len() > 2 && !STOP_WORDS.contains(&word.as_str()))
            .collect()
    }

    fn record_metrics(&self, search_type: SearchType, search_time: f64, results: usize) {
        let mut metrics = self.metrics.lock();
        metrics.total_searches += 1;
        match search_type {
            SearchType::Semantic => metrics.semantic_searches += 1,
            SearchType::Keyword => metrics.keyword_searches += 1,
            SearchType::Hybrid => metrics.hybrid_searches += 1,
            SearchType::MetadataFilter => {}
        }
        let total = metrics.total_searches as f64;
        metrics.avg_search_time = (metrics.avg_search_time * (total - 1.0) + search_time) / total;
        metrics.avg_results_returned =
            (metrics.avg_results_returned * (total - 1.0) + results as f64) / total;
    }

    pub fn metrics(&self) -> SearchMetrics {
        self.metrics.lock().clone()
    }
}

fn assign_ranks(results: &mut [SearchResult]) {
    for (index, result) in results.iter_mut().enumerate() {
        result.rank = index + 1;
    }
}

/// Keyword score: presence (0.5) plus a capped frequency bonus per keyword,
/// averaged, with a bonus when the whole query appears verbatim.
fn keyword_score(document: &str, keywords: &[String], original_query: &str) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let doc_lower = document.to_lowercase();
    let mut total = 0.0f32;
    for keyword in keywords {
        let count = doc_lower.matches(&keyword.to_lowercase()).count();
        if count > 0 {
            total += 0.5 + (count as f32 * 0.1).min(0.4);
        }
    }
    let mut normalized = total / keywords.len() as f32;
    if doc_lower.contains(&original_query.to_lowercase()) {
        normalized += 0.2;
    }
    normalized.min(1.0)
}

/// Content relevance for metadata-mode results: exact phrase wins, otherwise
/// the query-token overlap ratio, capped.
fn content_relevance(document: &str, query: &str) -> f32 {
    if query.is_empty() || document.is_empty() {
        return 0.0;
    }
    let doc_lower = document.to_lowercase();
    let query_lower = query.to_lowercase();
    if doc_lower.contains(&query_lower) {
        return 0.9;
    }
    let query_words: std::collections::HashSet<&str> = query_lower.split_whitespace().collect();
    if query_words.is_empty() {
        return 0.0;
    }
    let doc_words: std::collections::HashSet<&str> = doc_lower.split_whitespace().collect();
    let overlap = query_words.intersection(&doc_words).count();
    (overlap as f32 / query_words.len() as f32).min(0.8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::StageError;
    use crate::types::DocumentId;
    use crate::vector::{InMemoryVectorStore, VectorRecord};
    use async_trait::async_trait;
    use serde_json::json;

    /// Embedder that maps known phrases onto fixed unit vectors.
    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingModel for StubEmbedder {
        async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, StageError> {
            Ok(batch
                .iter()
                .map(|text| {
                    if text.contains("dragon") {
                        vec![1.0, 0.0, 0.0]
                    } else if text.contains("village") {
                        vec![0.0, 1.0, 0.0]
                    } else {
                        vec![0.0, 0.0, 1.0]
                    }
                })
                .collect())
        }

        fn model_name(&self) -> &str {
            "stub"
        }

        async fn healthy(&self) -> bool {
            true
        }
    }

    async fn seeded_retriever() -> DocumentRetriever {
        let store = Arc::new(InMemoryVectorStore::new());
        let doc_a = DocumentId::new();
        let doc_b = DocumentId::new();
        store
            .add(vec![
                VectorRecord {
                    id: VectorRecord::chunk_id(&doc_a, 0),
                    document_id: doc_a,
                    project_id: "project-1".to_string(),
                    embed_version: "v1.0".to_string(),
                    text: "The dragon sleeps on a hoard of gold".to_string(),
                    embedding: vec![1.0, 0.0, 0.0],
                    metadata: HashMap::from([
                        ("document_type".to_string(), json!("world_building")),
                        ("project_id".to_string(), json!("project-1")),
                    ]),
                },
                VectorRecord {
                    id: VectorRecord::chunk_id(&doc_b, 0),
                    document_id: doc_b,
                    project_id: "project-1".to_string(),
                    embed_version: "v1.0".to_string(),
                    text: "The village wakes to morning bells".to_string(),
                    embedding: vec![0.0, 1.0, 0.0],
                    metadata: HashMap::from([
                        ("document_type".to_string(), json!("scene")),
                        ("project_id".to_string(), json!("project-1")),
                    ]),
                },
            ])
            .await
            .unwrap();
        DocumentRetriever::new(store, Arc::new(StubEmbedder))
    }

    #[tokio::test]
    async fn test_semantic_search_ranks_by_similarity() {
        let retriever = seeded_retriever().await;
        let response = retriever
            .search(SearchRequest {
                similarity_threshold: 0.5,
                ..SearchRequest::semantic("where does the dragon live")
            })
            .await
            .unwrap();

        assert!(!response.results.is_empty());
        assert!(response.results[0].content.contains("dragon"));
        assert_eq!(response.results[0].rank, 1);
    }

    #[tokio::test]
    async fn test_semantic_threshold_filters_results() {
        let retriever = seeded_retriever().await;
        let response = retriever
            .search(SearchRequest {
                similarity_threshold: 0.99,
                ..SearchRequest::semantic("dragon")
            })
            .await
            .unwrap();

        // Only the perfectly aligned vector survives a 0.99 threshold
        assert_eq!(response.results.len(), 1);
    }

    #[tokio::test]
    async fn test_keyword_search_scores_and_ranks() {
        let retriever = seeded_retriever().await;
        let response = retriever
            .search(SearchRequest {
                search_type: SearchType::Keyword,
                ..SearchRequest::semantic("dragon gold")
            })
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
        let result = &response.results[0];
        assert!(result.content.contains("dragon"));
        // Two keywords present once each: (0.5 + 0.1) averaged = 0.6
        assert!((result.similarity_score - 0.6).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_keyword_verbatim_phrase_bonus() {
        let score = keyword_score(
            "the dragon sleeps on gold",
            &["dragon".to_string()],
            "dragon sleeps",
        );
        // presence 0.5 + frequency 0.1 + phrase bonus 0.2
        assert!((score - 0.8).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hybrid_combines_both_scores() {
        let retriever = seeded_retriever().await;
        let response = retriever
            .search(SearchRequest {
                search_type: SearchType::Hybrid,
                similarity_threshold: 0.5,
                ..SearchRequest::semantic("dragon gold")
            })
            .await
            .unwrap();

        assert!(!response.results.is_empty());
        let top = &response.results[0];
        assert!(top.content.contains("dragon"));
        // 0.6 * 1.0 (semantic) + 0.4 * 0.6 (keyword)
        assert!((top.similarity_score - 0.84).abs() < 0.01);
        let ranks: Vec<usize> = response.results.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, (1..=response.results.len()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_metadata_search_requires_filters() {
        let retriever = seeded_retriever().await;
        let err = retriever
            .search(SearchRequest {
                search_type: SearchType::MetadataFilter,
                ..SearchRequest::semantic("anything")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidRequest { field: "metadata_filter", .. }));
    }

    #[tokio::test]
    async fn test_metadata_search_scores_overlap() {
        let retriever = seeded_retriever().await;
        let response = retriever
            .search(SearchRequest {
                search_type: SearchType::MetadataFilter,
                document_type: Some("scene".to_string()),
                ..SearchRequest::semantic("village bells")
            })
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
        assert!(response.results[0].similarity_score > 0.0);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let retriever = seeded_retriever().await;

        assert!(retriever.search(SearchRequest::semantic("  ")).await.is_err());
        assert!(retriever
            .search(SearchRequest { max_results: 0, ..SearchRequest::semantic("q") })
            .await
            .is_err());
        assert!(retriever
            .search(SearchRequest { max_results: 500, ..SearchRequest::semantic("q") })
            .await
            .is_err());
        assert!(retriever
            .search(SearchRequest { similarity_threshold: 1.5, ..SearchRequest::semantic("q") })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_similarity_scores_in_unit_range() {
        let retriever = seeded_retriever().await;
        for search_type in [SearchType::Semantic, SearchType::Keyword, SearchType::Hybrid] {
            let response = retriever
                .search(SearchRequest {
                    search_type,
                    similarity_threshold: 0.0,
                    ..SearchRequest::semantic("dragon village gold bells")
                })
                .await
                .unwrap();
            for result in &response.results {
                assert!((0.0..=1.0).contains(&result.similarity_score));
            }
        }
    }

    #[tokio::test]
    async fn test_metrics_accumulate() {
        let retriever = seeded_retriever().await;
        retriever
            .search(SearchRequest { similarity_threshold: 0.0, ..SearchRequest::semantic("dragon") })
            .await
            .unwrap();
        retriever
            .search(SearchRequest {
                search_type: SearchType::Keyword,
                ..SearchRequest::semantic("village")
            })
            .await
            .unwrap();

        let metrics = retriever.metrics();
        assert_eq!(metrics.total_searches, 2);
        assert_eq!(metrics.semantic_searches, 1);
        assert_eq!(metrics.keyword_searches, 1);
    }

    #[test]
    fn test_stop_words_removed_from_keywords() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let retriever = DocumentRetriever::new(store, Arc::new(StubEmbedder));
        let keywords = retriever.extract_keywords("What is the dragon doing in the keep?");
        assert!(keywords.contains(&"dragon".to_string()));
        assert!(keywords.contains(&"keep".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"is".to_string()));
    }
}
