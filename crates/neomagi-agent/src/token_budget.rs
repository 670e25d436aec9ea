//! Token counting and budget evaluation against the configured context window.
//!
//! `TokenCounter` binds to a model at construction and resolves a tiktoken
//! encoding where one exists, falling back to a `chars / 4` estimate for
//! models tiktoken doesn't know (ADR 0029 in the original design: callers
//! must always be able to tell which mode produced a count).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::warn;

use neomagi_core::config::CompactionConfig;

const MSG_OVERHEAD_TOKENS: i64 = 4;
const REPLY_PRIMING_TOKENS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerMode {
    Exact,
    Estimate,
}

impl TokenizerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenizerMode::Exact => "exact",
            TokenizerMode::Estimate => "estimate",
        }
    }
}

/// A message in the shape `count_messages` needs — deliberately not tied to
/// any single provider's wire format, since it's used by the compaction
/// engine as well as the live chat path.
pub struct CountableMessage<'a> {
    pub role: &'a str,
    pub content: Option<&'a str>,
    pub name: Option<&'a str>,
    pub tool_calls_json: Option<&'a str>,
    pub tool_call_id: Option<&'a str>,
}

impl<'a> CountableMessage<'a> {
    pub fn new(role: &'a str, content: &'a str) -> Self {
        Self {
            role,
            content: Some(content),
            name: None,
            tool_calls_json: None,
            tool_call_id: None,
        }
    }
}

pub struct TokenCounter {
    encoding: Option<Arc<CoreBPE>>,
    mode: TokenizerMode,
}

impl TokenCounter {
    /// Resolve a tiktoken encoding for `model`; falls back to estimate mode
    /// for models tiktoken has no bpe ranks for (most non-OpenAI models).
    pub fn new(model: &str) -> Self {
        match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => Self {
                encoding: Some(Arc::new(bpe)),
                mode: TokenizerMode::Exact,
            },
            Err(_) => {
                warn!(model, mode = "estimate", "tokenizer_fallback");
                Self {
                    encoding: None,
                    mode: TokenizerMode::Estimate,
                }
            }
        }
    }

    pub fn tokenizer_mode(&self) -> TokenizerMode {
        self.mode
    }

    pub fn count_text(&self, text: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        match &self.encoding {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as i64,
            None => ((text.chars().count() as f64) / 4.0).ceil() as i64,
        }
    }

    /// Count tokens for a list of chat messages, OpenAI-format overhead
    /// included: a fixed per-message header cost plus one-time reply
    /// priming tokens for the whole request.
    pub fn count_messages(&self, messages: &[CountableMessage]) -> i64 {
        let mut total = 0i64;
        for msg in messages {
            total += MSG_OVERHEAD_TOKENS;
            if let Some(content) = msg.content.filter(|c| !c.is_empty()) {
                total += self.count_text(content);
            }
            if !msg.role.is_empty() {
                total += self.count_text(msg.role);
            }
            if let Some(name) = msg.name {
                total += self.count_text(name);
            }
            if let Some(tool_calls) = msg.tool_calls_json {
                total += self.count_text(tool_calls);
            }
            if let Some(tool_call_id) = msg.tool_call_id {
                total += self.count_text(tool_call_id);
            }
        }
        total += REPLY_PRIMING_TOKENS;
        total
    }

    pub fn count_tools_schema(&self, tools_json: &str) -> i64 {
        if tools_json.is_empty() {
            return 0;
        }
        self.count_text(tools_json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Ok,
    Warn,
    CompactNeeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub status: BudgetState,
    pub current_tokens: i64,
    pub usable_budget: i64,
    pub warn_threshold: i64,
    pub compact_threshold: i64,
    pub tokenizer_mode: String,
}

/// Evaluates token usage against a [`CompactionConfig`]'s thresholds for a
/// single bound model. Thresholds are computed once at construction.
pub struct BudgetTracker {
    counter: TokenCounter,
    usable_budget: i64,
    warn_threshold: i64,
    compact_threshold: i64,
}

impl BudgetTracker {
    pub fn new(config: &CompactionConfig, model: &str) -> Self {
        let counter = TokenCounter::new(model);
        Self {
            usable_budget: config.usable_budget() as i64,
            warn_threshold: config.warn_threshold() as i64,
            compact_threshold: config.compact_threshold() as i64,
            counter,
        }
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub fn check(&self, current_tokens: i64) -> BudgetStatus {
        let status = if current_tokens >= self.compact_threshold {
            BudgetState::CompactNeeded
        } else if current_tokens >= self.warn_threshold {
            BudgetState::Warn
        } else {
            BudgetState::Ok
        };

        BudgetStatus {
            status,
            current_tokens,
            usable_budget: self.usable_budget,
            warn_threshold: self.warn_threshold,
            compact_threshold: self.compact_threshold,
            tokenizer_mode: self.counter.tokenizer_mode().as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CompactionConfig {
        CompactionConfig {
            context_limit: 1000,
            warn_ratio: 0.7,
            compact_ratio: 0.85,
            reserved_output_tokens: 100,
            safety_margin_tokens: 100,
            ..Default::default()
        }
    }

    #[test]
    fn estimate_mode_used_for_unknown_model() {
        let counter = TokenCounter::new("totally-unknown-model-xyz");
        assert_eq!(counter.tokenizer_mode(), TokenizerMode::Estimate);
        assert_eq!(counter.count_text("abcd"), 1);
        assert_eq!(counter.count_text(""), 0);
    }

    #[test]
    fn count_messages_includes_overhead_and_priming() {
        let counter = TokenCounter::new("totally-unknown-model-xyz");
        let msgs = vec![CountableMessage::new("user", "hi")];
        // overhead(4) + role("user"=1 via chars/4 ceil) + content("hi"=1) + priming(3)
        let total = counter.count_messages(&msgs);
        assert!(total >= 4 + 3);
    }

    #[test]
    fn budget_tracker_thresholds() {
        let cfg = config();
        // usable = 1000 - 100 - 100 = 800; warn = 560; compact = 680
        let tracker = BudgetTracker::new(&cfg, "totally-unknown-model-xyz");
        assert_eq!(tracker.check(100).status, BudgetState::Ok);
        assert_eq!(tracker.check(600).status, BudgetState::Warn);
        assert_eq!(tracker.check(700).status, BudgetState::CompactNeeded);
    }
}
