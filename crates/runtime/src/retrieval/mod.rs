//! Query-side retrieval: search over the vector index and context assembly

pub mod context;
pub mod retriever;
pub mod tokens;

pub use context::{
    ContextBuildRequest, ContextBuildResponse, ContextBuilder, ContextSection, ContextType,
};
pub use retriever::{
    DocumentRetriever, RetrievalError, SearchRequest, SearchResponse, SearchResult, SearchType,
};
pub use tokens::{create_token_counter, ApproxTokenCounter, TiktokenCounter, TokenCounter};
