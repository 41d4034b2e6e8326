//! Token counting for context assembly.
//!
//! Provides a [`TokenCounter`] trait with a tiktoken-rs implementation for
//! models with a known BPE encoding and a conservative character-based
//! fallback for everything else.

/// Trait for counting tokens in text.
pub trait TokenCounter: Send + Sync {
    /// Count tokens in a single string.
    fn count_tokens(&self, text: &str) -> usize;
}

/// Token counter using tiktoken-rs (cl100k_base or o200k_base).
pub struct TiktokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenCounter {
    /// Create a counter for the given model name.
    ///
    /// Resolution order:
    /// 1. o200k_base for the GPT-4o family
    /// 2. cl100k_base for GPT-4, Claude, embeddings, and everything else
    ///    tiktoken supports
    pub fn for_model(model: &str) -> Option<Self> {
        let model_lower = model.to_lowercase();

        if model_lower.contains("gpt-4o")
            || model_lower.contains("o1")
            || model_lower.contains("o3")
        {
            if let Ok(bpe) = tiktoken_rs::o200k_base() {
                return Some(Self { bpe });
            }
        }

        tiktoken_rs::cl100k_base().ok().map(|bpe| Self { bpe })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Conservative fallback: one token per four characters, rounded up.
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

/// Create the best available token counter for the given model.
///
/// Resolution:
/// 1. tiktoken-rs for OpenAI, Claude, and embedding models
/// 2. the character approximation for unknown models or when the encoding
///    fails to load
pub fn create_token_counter(model: &str) -> Box<dyn TokenCounter> {
    let m = model.to_lowercase();

    let use_tiktoken = m.contains("gpt")
        || m.contains("claude")
        || m.contains("o1")
        || m.contains("o3")
        || m.contains("text-embedding");

    if use_tiktoken {
        if let Some(counter) = TiktokenCounter::for_model(model) {
            return Box::new(counter);
        }
    }
    Box::new(ApproxTokenCounter)
}
