//! Token counting for relay frames.
//!
//! Counts come from the model's BPE tokenizer. BPE is not context-free across
//! chunk boundaries: the per-delta counts attached to text frames can sum to
//! slightly more or less than the count of the reassembled reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tiktoken_rs::CoreBPE;
use tracing::{debug, info};

use crate::error::TokenizerError;
use crate::message::PromptMessage;

pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

impl Tokenizer for CoreBPE {
    fn count(&self, text: &str) -> usize {
        self.encode_with_special_tokens(text).len()
    }
}

/// Hands out the tokenizer for a model identifier.
pub trait TokenizerSource: Send + Sync {
    fn tokenizer(&self, model: &str) -> Result<Arc<dyn Tokenizer>, TokenizerError>;
}

/// tiktoken-backed tokenizers, built once per model and cached.
#[derive(Default)]
pub struct TiktokenRegistry {
    cache: Mutex<HashMap<String, Arc<CoreBPE>>>,
}

impl TiktokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build tokenizers for every model up front so a misconfigured model
    /// stops startup instead of failing a request later.
    pub fn preload<'a>(&self, models: impl IntoIterator<Item = &'a String>) -> Result<(), TokenizerError> {
        for model in models {
            self.tokenizer(model)?;
            info!("🔤 Tokenizer ready for {}", model);
        }
        Ok(())
    }
}

impl TokenizerSource for TiktokenRegistry {
    fn tokenizer(&self, model: &str) -> Result<Arc<dyn Tokenizer>, TokenizerError> {
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(bpe) = cache.get(model) {
                debug!("Tokenizer cache hit for model: {}", model);
                let tokenizer: Arc<dyn Tokenizer> = bpe.clone();
                return Ok(tokenizer);
            }
        }

        debug!("Tokenizer cache miss for model: {}, building BPE", model);
        let bpe = tiktoken_rs::get_bpe_from_model(model).map_err(|e| TokenizerError {
            model: model.to_string(),
            reason: e.to_string(),
        })?;
        let bpe = Arc::new(bpe);

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let tokenizer: Arc<dyn Tokenizer> = cache.entry(model.to_string()).or_insert(bpe).clone();
        Ok(tokenizer)
    }
}

/// Per-session counter bound to one model's tokenizer.
#[derive(Clone)]
pub struct TokenCounter {
    model: String,
    tokenizer: Arc<dyn Tokenizer>,
}

impl TokenCounter {
    pub fn for_model(source: &dyn TokenizerSource, model: &str) -> Result<Self, TokenizerError> {
        Ok(Self {
            model: model.to_string(),
            tokenizer: source.tokenizer(model)?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.tokenizer.count(text)
    }

    /// Count the concatenation of every message's content.
    pub fn count_input(&self, messages: &[PromptMessage]) -> usize {
        let joined: String = messages.iter().map(|m| m.content.as_str()).collect();
        self.count(&joined)
    }
}
