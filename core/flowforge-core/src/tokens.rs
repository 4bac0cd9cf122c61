//! Token counting and cost estimation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tiktoken_rs::CoreBPE;
use tracing::debug;

pub const DEFAULT_MODEL: &str = "gpt-4";

/// USD per 1K output tokens.
const PRICING: &[(&str, f64)] = &[
    ("gpt-4", 0.06),
    ("gpt-4-turbo", 0.03),
    ("gpt-3.5-turbo", 0.002),
    ("claude-3-opus", 0.075),
    ("claude-3-sonnet", 0.015),
];

pub fn price_per_1k(model: &str) -> f64 {
    let lookup = |name: &str| {
        PRICING
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, price)| *price)
    };
    lookup(model)
        .or_else(|| lookup(DEFAULT_MODEL))
        .unwrap_or(0.06)
}

pub fn estimate_cost(tokens: u64, model: &str) -> f64 {
    (tokens as f64 / 1000.0) * price_per_1k(model)
}

/// Resolved encoders keyed by model name. `None` records a failed init so
/// the fallback path is taken without retrying.
#[derive(Default, Clone)]
pub struct EncoderCache {
    inner: Arc<Mutex<HashMap<String, Option<Arc<CoreBPE>>>>>,
}

impl EncoderCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, model: &str) -> Option<Arc<CoreBPE>> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = guard.get(model) {
            return entry.clone();
        }
        let encoder = tiktoken_rs::get_bpe_from_model(model)
            .or_else(|_| tiktoken_rs::cl100k_base())
            .map(Arc::new)
            .map_err(|err| {
                debug!(model, error = %err, "Token encoder unavailable; using length heuristic");
            })
            .ok();
        guard.insert(model.to_string(), encoder.clone());
        encoder
    }
}

#[derive(Clone)]
pub struct TokenCounter {
    model: String,
    encoder: Option<Arc<CoreBPE>>,
}

impl TokenCounter {
    pub fn new(model: &str, cache: &EncoderCache) -> Self {
        let model = if model.trim().is_empty() {
            DEFAULT_MODEL
        } else {
            model.trim()
        };
        Self {
            model: model.to_string(),
            encoder: cache.resolve(model),
        }
    }

    /// Counter that always uses the length heuristic.
    pub fn heuristic(model: &str) -> Self {
        Self {
            model: model.to_string(),
            encoder: None,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn count(&self, text: &str) -> u64 {
        match &self.encoder {
            Some(encoder) => encoder.encode_with_special_tokens(text).len() as u64,
            None => (text.len() / 4) as u64,
        }
    }
}
