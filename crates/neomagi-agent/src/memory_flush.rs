//! Pre-compaction memory flush candidate generation.
//!
//! Called exclusively by the compaction engine — the agent loop must never
//! call this directly, since candidates are only meaningful for turns about
//! to be folded out of the live context.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::pipeline::compact::Turn;

static EXPLICIT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)记住|请记住|以后|我喜欢|我不喜欢|我偏好|我讨厌|永远不要|总是").unwrap(),
        Regex::new(r"(?i)\b(remember|always|never|prefer|i like|i don'?t like|i hate|from now on)\b")
            .unwrap(),
    ]
});

static DECISION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)我们决定|确认|最终|选定|敲定|同意").unwrap(),
        Regex::new(r"(?i)\b(we decided|confirmed|finalized|agreed|settled on|chosen)\b").unwrap(),
    ]
});

static SKIP_PATTERNS: Lazy<Vec<Regex>> =
    Lazy::new(|| vec![Regex::new(r"(?i)^(ok|好的?|嗯|是的?|对|谢谢|thanks|sure|got it|明白)$").unwrap()]);

static NEVER_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)永远不要|never|不要|禁止").unwrap());

/// A single candidate for long-term memory, extracted from a compressible
/// turn about to be compacted away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryFlushCandidate {
    pub candidate_id: String,
    pub source_session_id: String,
    pub source_message_ids: Vec<String>,
    pub candidate_text: String,
    pub constraint_tags: Vec<String>,
    pub confidence: f64,
    pub created_at: String,
}

/// Rule-based extraction — no LLM call. Confidence tiers:
/// explicit user declaration (0.9) > confirmed decision (0.6) >
/// general conversation over 20 chars (0.3) > everything else (skipped).
pub struct MemoryFlushGenerator {
    max_candidates: usize,
    max_text_bytes: usize,
}

impl MemoryFlushGenerator {
    pub fn new(max_candidates: u32, max_text_bytes: usize) -> Self {
        Self {
            max_candidates: max_candidates as usize,
            max_text_bytes,
        }
    }

    pub fn generate(&self, compressible_turns: &[Turn], session_id: &str) -> Vec<MemoryFlushCandidate> {
        let mut candidates = Vec::new();

        'turns: for turn in compressible_turns {
            if candidates.len() >= self.max_candidates {
                break;
            }
            let user_msgs: Vec<_> = turn
                .messages
                .iter()
                .filter(|m| m.role == "user" && !m.content.is_empty())
                .collect();
            if user_msgs.is_empty() {
                continue;
            }

            for msg in user_msgs {
                if candidates.len() >= self.max_candidates {
                    break 'turns;
                }
                let stripped = msg.content.trim();
                if SKIP_PATTERNS.iter().any(|p| p.is_match(stripped)) {
                    continue;
                }

                let (tags, confidence) = classify(stripped);
                if confidence < 0.1 {
                    continue;
                }

                let text = truncate_utf8(stripped, self.max_text_bytes);

                candidates.push(MemoryFlushCandidate {
                    candidate_id: Uuid::new_v4().to_string(),
                    source_session_id: session_id.to_string(),
                    source_message_ids: vec![msg.seq.to_string()],
                    candidate_text: text,
                    constraint_tags: tags,
                    confidence: confidence.clamp(0.0, 1.0),
                    created_at: chrono::Utc::now().to_rfc3339(),
                });
            }
        }

        info!(
            session_id,
            candidate_count = candidates.len(),
            turn_count = compressible_turns.len(),
            "memory_flush_generated"
        );
        candidates
    }
}

fn classify(text: &str) -> (Vec<String>, f64) {
    if EXPLICIT_PATTERNS.iter().any(|p| p.is_match(text)) {
        let mut tags = vec!["user_preference".to_string()];
        if NEVER_PATTERN.is_match(text) {
            tags.push("safety_boundary".to_string());
        }
        return (tags, 0.9);
    }

    if DECISION_PATTERNS.iter().any(|p| p.is_match(text)) {
        return (vec!["fact".to_string()], 0.6);
    }

    if text.chars().count() > 20 {
        return (vec!["fact".to_string()], 0.3);
    }

    (Vec::new(), 0.0)
}

/// Truncate to at most `max_bytes` UTF-8 bytes without splitting a
/// multi-byte character.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::compact::{Message, Turn};

    fn turn(seq: i64, content: &str) -> Turn {
        Turn {
            messages: vec![Message {
                seq,
                role: "user".to_string(),
                content: content.to_string(),
                tokens: None,
            }],
        }
    }

    #[test]
    fn explicit_preference_gets_high_confidence() {
        let gen = MemoryFlushGenerator::new(20, 2000);
        let candidates = gen.generate(&[turn(1, "I prefer dark mode always")], "s1");
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].confidence - 0.9).abs() < 1e-9);
        assert_eq!(candidates[0].constraint_tags, vec!["user_preference"]);
    }

    #[test]
    fn never_adds_safety_boundary_tag() {
        let gen = MemoryFlushGenerator::new(20, 2000);
        let candidates = gen.generate(&[turn(1, "never call me after 10pm")], "s1");
        assert!(candidates[0]
            .constraint_tags
            .contains(&"safety_boundary".to_string()));
    }

    #[test]
    fn casual_ack_is_skipped() {
        let gen = MemoryFlushGenerator::new(20, 2000);
        let candidates = gen.generate(&[turn(1, "ok")], "s1");
        assert!(candidates.is_empty());
    }

    #[test]
    fn short_neutral_text_is_skipped() {
        let gen = MemoryFlushGenerator::new(20, 2000);
        let candidates = gen.generate(&[turn(1, "nice")], "s1");
        assert!(candidates.is_empty());
    }

    #[test]
    fn long_neutral_text_gets_low_confidence_fact() {
        let gen = MemoryFlushGenerator::new(20, 2000);
        let candidates = gen.generate(
            &[turn(1, "So I went to the store today and bought some groceries for dinner")],
            "s1",
        );
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn respects_max_candidates_cap() {
        let gen = MemoryFlushGenerator::new(1, 2000);
        let turns = vec![
            turn(1, "I prefer tea over coffee"),
            turn(2, "I prefer quiet mornings"),
        ];
        let candidates = gen.generate(&turns, "s1");
        assert_eq!(candidates.len(), 1);
    }
}
