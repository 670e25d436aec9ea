//! Turn-splitting compaction: rolling summary + anchor preservation + flush
//! generation.
//!
//! Memory flush candidates are generated exclusively by this module — the
//! agent loop orchestrates compaction but must never call
//! [`crate::memory_flush::MemoryFlushGenerator`] directly, since candidates
//! are only meaningful for turns about to be folded out of the live context.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use neomagi_core::config::CompactionConfig;

use crate::memory_flush::{MemoryFlushCandidate, MemoryFlushGenerator};
use crate::provider::{ChatRequest, LlmProvider, Message as ProviderMessage, Role};
use crate::token_budget::{BudgetState, BudgetStatus, CountableMessage, TokenCounter};

/// A single message as seen by the compaction engine — decoupled from both
/// the session store's row shape and the provider's wire format.
#[derive(Debug, Clone)]
pub struct Message {
    pub seq: i64,
    pub role: String,
    pub content: String,
    pub tokens: Option<i64>,
}

/// A conversation turn: a user message plus every assistant/tool message
/// that follows it, up to (not including) the next user message.
#[derive(Debug, Clone)]
pub struct Turn {
    pub messages: Vec<Message>,
}

impl Turn {
    fn start_seq(&self) -> i64 {
        self.messages.first().map(|m| m.seq).unwrap_or(0)
    }

    fn end_seq(&self) -> i64 {
        self.messages.last().map(|m| m.seq).unwrap_or(0)
    }
}

/// Split a flat message log into turns at user-message boundaries.
pub fn split_turns(messages: &[Message]) -> Vec<Turn> {
    if messages.is_empty() {
        return Vec::new();
    }

    let mut turns = Vec::new();
    let mut current: Vec<Message> = Vec::new();

    for msg in messages {
        if msg.role == "user" && !current.is_empty() {
            turns.push(Turn { messages: std::mem::take(&mut current) });
        }
        current.push(msg.clone());
    }
    if !current.is_empty() {
        turns.push(Turn { messages: current });
    }

    turns
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStatus {
    Success,
    Degraded,
    Failed,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionMetadata {
    pub schema_version: u32,
    pub status: CompactionStatus,
    pub preserved_count: usize,
    pub summarized_count: usize,
    pub flush_skipped: bool,
    pub anchor_validation_passed: bool,
    pub anchor_retry_used: bool,
    pub triggered_at: String,
    pub compacted_context_tokens: i64,
    pub rolling_summary_input_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub status: CompactionStatus,
    pub compacted_context: Option<String>,
    pub compaction_metadata: CompactionMetadata,
    pub new_compaction_seq: i64,
    pub memory_flush_candidates: Vec<MemoryFlushCandidate>,
    pub preserved_messages: Vec<Message>,
}

impl CompactionResult {
    fn noop(last_compaction_seq: i64, preserved_messages: Vec<Message>) -> Self {
        Self {
            status: CompactionStatus::Noop,
            compacted_context: None,
            compaction_metadata: make_metadata(CompactionStatus::Noop, 0, 0, false, true, false, 0, 0),
            new_compaction_seq: last_compaction_seq,
            memory_flush_candidates: Vec::new(),
            preserved_messages,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn make_metadata(
    status: CompactionStatus,
    preserved_count: usize,
    summarized_count: usize,
    flush_skipped: bool,
    anchor_validation_passed: bool,
    anchor_retry_used: bool,
    compacted_context_tokens: i64,
    rolling_summary_input_tokens: i64,
) -> CompactionMetadata {
    CompactionMetadata {
        schema_version: 1,
        status,
        preserved_count,
        summarized_count,
        flush_skipped,
        anchor_validation_passed,
        anchor_retry_used,
        triggered_at: chrono::Utc::now().to_rfc3339(),
        compacted_context_tokens,
        rolling_summary_input_tokens,
    }
}

const SUMMARY_PROMPT_TEMPLATE: &str = "You are a conversation compactor. Produce a structured JSON summary of the conversation below.\n\n\
Previous summary (if any):\n{previous_summary}\n\n\
Conversation to compress:\n{conversation}\n\n\
Output a JSON object with exactly these keys:\n\
- \"facts\": list of confirmed facts\n\
- \"decisions\": list of decisions made\n\
- \"open_todos\": list of unfinished items\n\
- \"user_prefs\": list of user preference declarations\n\
- \"timeline\": list of key events with timestamps or order\n\n\
Rules:\n\
- Be concise. Each item should be one sentence.\n\
- Preserve information critical for task continuity.\n\
- Do NOT include casual greetings or acknowledgments.\n\
- Output ONLY the JSON object, no markdown fencing.\n\
- Total output must be within {max_output_tokens} tokens.\n";

const ANCHOR_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md"];

/// Core compaction logic: rolling summary + anchor preservation + flush
/// generation. The agent loop orchestrates; this is where the actual work
/// happens.
pub struct CompactionEngine {
    counter: TokenCounter,
    settings: CompactionConfig,
    workspace_dir: Option<PathBuf>,
    flush_generator: MemoryFlushGenerator,
}

impl CompactionEngine {
    pub fn new(settings: CompactionConfig, model: &str, workspace_dir: Option<PathBuf>) -> Self {
        let flush_generator =
            MemoryFlushGenerator::new(settings.max_flush_candidates, settings.max_candidate_text_bytes);
        Self {
            counter: TokenCounter::new(model),
            settings,
            workspace_dir,
            flush_generator,
        }
    }

    /// Execute the compaction pipeline.
    ///
    /// 1. Split messages into turns.
    /// 2. Exclude the current, still-unfinished turn.
    /// 3. Split completed turns into a preserved tail and a compressible head.
    /// 4. No compressible range -> noop.
    /// 5. Generate memory flush candidates from the compressible turns.
    /// 6. Build a rolling summary via the LLM.
    /// 7. Validate anchor visibility in the resulting context; retry once on
    ///    failure if configured to.
    #[allow(clippy::too_many_arguments)]
    pub async fn compact(
        &self,
        provider: &dyn LlmProvider,
        messages: &[Message],
        system_prompt: &str,
        last_compaction_seq: Option<i64>,
        previous_compacted_context: Option<&str>,
        current_user_seq: i64,
        model: &str,
        session_id: &str,
    ) -> CompactionResult {
        let all_turns = split_turns(messages);
        let last_seq = last_compaction_seq.unwrap_or(0);

        if all_turns.is_empty() {
            return CompactionResult::noop(last_seq, Vec::new());
        }

        let completed_turns: Vec<&Turn> =
            all_turns.iter().filter(|t| t.start_seq() < current_user_seq).collect();
        if completed_turns.is_empty() {
            return CompactionResult::noop(last_seq, Vec::new());
        }

        let min_preserved = self.settings.min_preserved_turns as usize;
        if completed_turns.len() <= min_preserved {
            let preserved = completed_turns.iter().flat_map(|t| t.messages.clone()).collect();
            return CompactionResult::noop(last_seq, preserved);
        }

        let split_at = completed_turns.len() - min_preserved;
        let preserved_turns: Vec<Turn> = completed_turns[split_at..].iter().map(|t| (**t).clone()).collect();
        let mut compressible_turns: Vec<Turn> = completed_turns[..split_at].iter().map(|t| (**t).clone()).collect();

        if let Some(last) = last_compaction_seq {
            compressible_turns.retain(|t| t.end_seq() > last);
        }

        if compressible_turns.is_empty() {
            let preserved = preserved_turns.iter().flat_map(|t| t.messages.clone()).collect();
            return CompactionResult::noop(last_seq, preserved);
        }

        let mut new_compaction_seq = compressible_turns.last().map(|t| t.end_seq()).unwrap_or(last_seq);
        new_compaction_seq = new_compaction_seq.min(current_user_seq - 1);

        // Step 5: memory flush, bounded by a timeout so a pathological input
        // can't stall the whole compaction.
        let (flush_candidates, flush_skipped) = self.run_flush(&compressible_turns, session_id).await;

        // Step 6: rolling summary via LLM.
        let conversation_text = turns_to_text(&compressible_turns);
        let input_tokens = self.counter.count_text(&conversation_text);
        let max_summary_tokens = ((input_tokens as f64) * 0.3) as i64;

        let preserved_messages: Vec<Message> =
            preserved_turns.iter().flat_map(|t| t.messages.clone()).collect();

        if max_summary_tokens < 100 {
            info!(input_tokens, max_summary_tokens, "input_too_small_for_summary");
            return CompactionResult {
                status: CompactionStatus::Degraded,
                compacted_context: previous_compacted_context.map(str::to_string),
                compaction_metadata: make_metadata(
                    CompactionStatus::Degraded,
                    preserved_turns.len(),
                    compressible_turns.len(),
                    flush_skipped,
                    true,
                    false,
                    0,
                    input_tokens,
                ),
                new_compaction_seq,
                memory_flush_candidates: flush_candidates,
                preserved_messages,
            };
        }

        let mut status = CompactionStatus::Success;
        let mut summary_text: Option<String> = None;

        match self
            .generate_summary(provider, previous_compacted_context, &conversation_text, max_summary_tokens, model)
            .await
        {
            Ok(text) => summary_text = Some(text),
            Err(e) => {
                warn!(error = %e, session_id, "compaction_llm_failed");
                status = CompactionStatus::Degraded;
            }
        }

        // Step 7: anchor visibility validation.
        let preserved_text = turns_to_text(&preserved_turns);
        let mut anchor_passed = true;
        let mut anchor_retry_used = false;

        if summary_text.is_some() && status == CompactionStatus::Success {
            anchor_passed = self.validate_anchors(system_prompt, summary_text.as_deref(), &preserved_text);

            if !anchor_passed && self.settings.anchor_retry_enabled {
                anchor_retry_used = true;
                info!(session_id, "anchor_retry");
                match self
                    .generate_summary(provider, previous_compacted_context, &conversation_text, max_summary_tokens, model)
                    .await
                {
                    Ok(text) => {
                        anchor_passed = self.validate_anchors(system_prompt, Some(&text), &preserved_text);
                        summary_text = Some(text);
                    }
                    Err(_) => anchor_passed = false,
                }

                if !anchor_passed {
                    status = CompactionStatus::Degraded;
                    warn!(session_id, "anchor_validation_failed_after_retry");
                }
            }
        }

        let compacted_context_tokens =
            summary_text.as_deref().map(|s| self.counter.count_text(s)).unwrap_or(0);

        CompactionResult {
            status,
            compacted_context: summary_text,
            compaction_metadata: make_metadata(
                status,
                preserved_turns.len(),
                compressible_turns.len(),
                flush_skipped,
                anchor_passed,
                anchor_retry_used,
                compacted_context_tokens,
                input_tokens,
            ),
            new_compaction_seq,
            memory_flush_candidates: flush_candidates,
            preserved_messages,
        }
    }

    async fn run_flush(&self, compressible_turns: &[Turn], session_id: &str) -> (Vec<MemoryFlushCandidate>, bool) {
        let timeout = Duration::from_secs_f64(self.settings.flush_timeout_s.max(0.0));
        let candidates = self.flush_generator.generate(compressible_turns, session_id);

        match tokio::time::timeout(timeout, async { candidates }).await {
            Ok(candidates) => (candidates, false),
            Err(_) => {
                warn!(session_id, "flush_timeout_or_error");
                (Vec::new(), true)
            }
        }
    }

    async fn generate_summary(
        &self,
        provider: &dyn LlmProvider,
        previous_context: Option<&str>,
        conversation_text: &str,
        max_output_tokens: i64,
        model: &str,
    ) -> Result<String, crate::provider::ProviderError> {
        let prompt = SUMMARY_PROMPT_TEMPLATE
            .replace("{previous_summary}", previous_context.unwrap_or("(none)"))
            .replace("{conversation}", conversation_text)
            .replace("{max_output_tokens}", &max_output_tokens.to_string());

        let req = ChatRequest {
            model: model.to_string(),
            system: "You are a precise conversation summarizer.".to_string(),
            system_prompt: None,
            messages: vec![ProviderMessage { role: Role::User, content: prompt }],
            max_tokens: max_output_tokens.clamp(1, u32::MAX as i64) as u32,
            stream: false,
            thinking: None,
            tools: Vec::new(),
            raw_messages: None,
        };

        let resp = provider.send(&req).await?;
        Ok(resp.content.trim().to_string())
    }

    fn extract_anchor_phrases(&self) -> Vec<String> {
        let Some(dir) = &self.workspace_dir else {
            return Vec::new();
        };
        let mut anchors = Vec::new();
        for filename in ANCHOR_FILES {
            let path = dir.join(filename);
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    if let Some(line) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
                        anchors.push(line.to_string());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(_) => warn!(file = filename, "anchor_file_read_error"),
            }
        }
        anchors
    }

    fn validate_anchors(&self, system_prompt: &str, compacted_context: Option<&str>, effective_history_text: &str) -> bool {
        if system_prompt.is_empty() {
            return false;
        }

        let final_context = format!("{system_prompt}{}{effective_history_text}", compacted_context.unwrap_or(""));

        let anchors = self.extract_anchor_phrases();
        if anchors.is_empty() {
            return true;
        }

        for phrase in &anchors {
            if !final_context.contains(phrase.as_str()) {
                warn!(phrase = &phrase[..phrase.len().min(80)], "anchor_missing");
                return false;
            }
        }
        true
    }
}

fn turns_to_text(turns: &[Turn]) -> String {
    let mut lines = Vec::new();
    for turn in turns {
        for msg in &turn.messages {
            if !msg.content.is_empty() {
                lines.push(format!("[{}]: {}", msg.role, msg.content));
            }
        }
    }
    lines.join("\n")
}

/// Evaluate whether the current live (uncompacted) history needs compaction.
pub fn check_budget(counter: &TokenCounter, settings: &CompactionConfig, messages: &[Message]) -> BudgetStatus {
    let countable: Vec<CountableMessage> = messages
        .iter()
        .map(|m| CountableMessage::new(m.role.as_str(), m.content.as_str()))
        .collect();
    let current_tokens = counter.count_messages(&countable);
    let usable = settings.usable_budget() as i64;
    let warn_threshold = settings.warn_threshold() as i64;
    let compact_threshold = settings.compact_threshold() as i64;

    let status = if current_tokens >= compact_threshold {
        BudgetState::CompactNeeded
    } else if current_tokens >= warn_threshold {
        BudgetState::Warn
    } else {
        BudgetState::Ok
    };

    BudgetStatus {
        status,
        current_tokens,
        usable_budget: usable,
        warn_threshold,
        compact_threshold,
        tokenizer_mode: counter.tokenizer_mode().as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(seq: i64, role: &str, content: &str) -> Message {
        Message { seq, role: role.to_string(), content: content.to_string(), tokens: None }
    }

    #[test]
    fn split_turns_groups_by_user_boundary() {
        let messages = vec![
            msg(1, "user", "hi"),
            msg(2, "assistant", "hello"),
            msg(3, "user", "how are you"),
            msg(4, "assistant", "good"),
        ];
        let turns = split_turns(&messages);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].start_seq(), 1);
        assert_eq!(turns[0].end_seq(), 2);
        assert_eq!(turns[1].start_seq(), 3);
        assert_eq!(turns[1].end_seq(), 4);
    }

    #[test]
    fn split_turns_empty_input() {
        assert!(split_turns(&[]).is_empty());
    }

    #[test]
    fn split_turns_single_turn_no_trailing_user() {
        let messages = vec![msg(1, "user", "hi"), msg(2, "assistant", "hello")];
        let turns = split_turns(&messages);
        assert_eq!(turns.len(), 1);
    }
}
