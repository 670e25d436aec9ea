//! Agent Loop (C13): the per-turn pipeline the Dispatch Orchestrator drives.
//!
//! One call to [`run_turn`] handles exactly one incoming user message and
//! yields events through `tx` as they happen — text deltas, tool-call
//! announcements, and tool-denied announcements — so the caller can stream
//! them straight back to the adapter without buffering a whole turn.

use std::path::Path;

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use neomagi_core::config::{CompactionConfig, MemoryConfig};
use neomagi_core::types::{RiskLevel, ToolMode};
use neomagi_memory::daily_notes::{build_recent_notes_block, DailyNotesIndexer, DailyNotesWriter, NoteEntry};
use neomagi_sessions::{Message as StoredMessage, SessionError, SessionManager};

use crate::guardrail::{check_pre_tool_guard, Guardrail};
use crate::pipeline::compact::{CompactionEngine, CompactionStatus, Message as CompactMessage};
use crate::prompt::{PromptBuilder, PromptContext, SessionInfo};
use crate::provider::{ChatRequest, LlmProvider, Message as ProviderMessage, Role};
use crate::scope::{resolve_scope_key, SessionIdentity};
use crate::stream::StreamEvent;
use crate::tools::ToolRegistry;

/// Hard ceiling on tool-call round-trips within a single turn. Distinct from
/// `tool_loop::MAX_ITERATIONS` (the teacher's older, simpler loop) — this one
/// also bounds compaction re-derivation and guard/mode gating per iteration.
const MAX_TOOL_ITERATIONS: usize = 25;

#[derive(Debug, Clone)]
pub enum AgentEvent {
    TextChunk { text: String },
    ToolCall { call_id: String, tool_name: String, arguments: serde_json::Value },
    ToolDenied { call_id: String, tool_name: String, mode: ToolMode, error_code: String, message: String, next_action: String },
}

#[derive(Debug, Error)]
pub enum AgentLoopError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),
}

impl AgentLoopError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentLoopError::Session(e) => e.code(),
            AgentLoopError::Provider(_) => "LLM_PROVIDER_ERROR",
        }
    }
}

/// A structured tool-result error, always JSON-serializable with an
/// `error_code` field so the model can reason about why a call failed.
fn structured_error(error_code: &str, message: impl Into<String>) -> String {
    json!({ "error_code": error_code, "message": message.into() }).to_string()
}

/// Parse tool-call arguments, which arrive as a JSON string. Null becomes an
/// empty object; anything that doesn't parse to a JSON object is rejected
/// with `INVALID_ARGS` rather than panicking or silently coercing.
fn parse_tool_arguments(raw: &serde_json::Value) -> Result<serde_json::Value, String> {
    let raw_str = match raw {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => return Ok(json!({})),
        other => other.to_string(),
    };
    if raw_str.trim().is_empty() {
        return Ok(json!({}));
    }
    match serde_json::from_str::<serde_json::Value>(&raw_str) {
        Ok(serde_json::Value::Null) => Ok(json!({})),
        Ok(v @ serde_json::Value::Object(_)) => Ok(v),
        Ok(_) => Err("tool arguments must be a JSON object".to_string()),
        Err(e) => Err(format!("failed to parse tool arguments: {e}")),
    }
}

/// Everything [`run_turn`] needs beyond the session identity itself. Bundled
/// so the Dispatch Orchestrator can build one of these per dispatch without
/// a long parameter list at every call site.
pub struct AgentLoopDeps<'a> {
    pub sessions: &'a SessionManager,
    pub provider: &'a dyn LlmProvider,
    pub model: &'a str,
    pub prompt_builder: &'a PromptBuilder,
    pub tools: &'a ToolRegistry,
    pub guardrail: &'a Guardrail,
    pub compaction_config: &'a CompactionConfig,
    pub memory_config: &'a MemoryConfig,
    pub memory_writer: &'a DailyNotesWriter,
    pub memory_indexer: &'a DailyNotesIndexer,
    pub workspace_dir: &'a Path,
    pub max_compactions_per_request: u32,
}

/// Run the per-turn pipeline described in spec §4.9 for one user message,
/// forwarding every event through `tx`.
#[instrument(skip(deps, tx, identity), fields(session_id))]
pub async fn run_turn(
    deps: &AgentLoopDeps<'_>,
    session_id: &str,
    lock_token: &str,
    identity: Option<&SessionIdentity>,
    dm_scope: &str,
    tx: &mpsc::Sender<AgentEvent>,
    user_message: &str,
) -> Result<(), AgentLoopError> {
    // 1. Append the user message (fencing-guarded).
    deps.sessions.append_message(session_id, lock_token, "user", user_message, None, Some(deps.model))?;

    // 2. Compaction state, scope_key, session mode.
    let mut compaction_state = deps.sessions.get_compaction_state(session_id)?;
    let scope_key = identity
        .map(|id| resolve_scope_key(id, dm_scope).unwrap_or_else(|_| "main".to_string()))
        .unwrap_or_else(|| "main".to_string());
    let mode = deps.sessions.get_mode(session_id);

    // 3. Effective history (strictly after the compaction watermark).
    let (mut compacted_context, mut history) = deps.sessions.get_effective_history(session_id)?;

    let today = chrono::Utc::now().date_naive();
    let workspace_notes = build_recent_notes_block(deps.workspace_dir, &scope_key, today, deps.memory_config.daily_notes_max_tokens as usize * 4);

    let mut compactions_run = 0u32;

    for iteration in 0..MAX_TOOL_ITERATIONS {
        let session_info = SessionInfo {
            session_key: session_id.to_string(),
            turn_count: history.len() as u32,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let system_prompt = deps.prompt_builder.build_prompt_full(&PromptContext {
            user_context: None,
            session_info: Some(&session_info),
            compacted_context: compacted_context.as_deref(),
            memory_recall: None,
            workspace_notes: workspace_notes.as_deref(),
        });

        let tools_schema = deps.tools.tools_schema(mode);
        let provider_messages = to_provider_messages(&history);

        let current_user_seq = history.iter().rev().find(|m| m.role == "user").map(|m| m.seq).unwrap_or(0);

        let compact_messages: Vec<CompactMessage> = history
            .iter()
            .map(|m| CompactMessage { seq: m.seq, role: m.role.clone(), content: m.content.clone(), tokens: m.tokens })
            .collect();

        let budget_tracker = crate::token_budget::BudgetTracker::new(deps.compaction_config, deps.model);
        let counted_tokens = budget_tracker.counter().count_messages(
            &history
                .iter()
                .map(|m| crate::token_budget::CountableMessage {
                    role: &m.role,
                    content: Some(&m.content),
                    name: None,
                    tool_calls_json: None,
                    tool_call_id: None,
                })
                .collect::<Vec<_>>(),
        ) + budget_tracker.counter().count_tools_schema(&serde_json::to_string(&tools_schema).unwrap_or_default());
        let budget_status = budget_tracker.check(counted_tokens);
        info!(?budget_status.status, tokens = counted_tokens, iteration, "agent_loop_budget_check");

        if budget_status.status == crate::token_budget::BudgetState::CompactNeeded
            && compactions_run < deps.max_compactions_per_request
        {
            let engine = CompactionEngine::new(deps.compaction_config.clone(), deps.model, Some(deps.workspace_dir.to_path_buf()));
            let result = engine
                .compact(
                    deps.provider,
                    &compact_messages,
                    &system_prompt.to_plain_text(),
                    Some(compaction_state.last_compaction_seq),
                    compacted_context.as_deref(),
                    current_user_seq,
                    deps.model,
                    session_id,
                )
                .await;

            compactions_run += 1;

            if !matches!(result.status, CompactionStatus::Noop) {
                if let Some(summary) = &result.compacted_context {
                    let metadata_json = serde_json::to_string(&result.compaction_metadata).unwrap_or_default();
                    match deps.sessions.store_compaction_result(session_id, lock_token, summary, result.new_compaction_seq, &metadata_json) {
                        Ok(()) => {
                            bridge_flush_candidates(deps, &scope_key, session_id, &result.memory_flush_candidates);
                            compaction_state.last_compaction_seq = result.new_compaction_seq;
                            let (new_compacted, new_history) = deps.sessions.get_effective_history(session_id)?;
                            compacted_context = new_compacted;
                            history = new_history;
                        }
                        Err(e) => {
                            warn!(error = %e, "compaction_store_failed, continuing without compaction");
                        }
                    }
                }
            }
        }

        // 4/5. Pre-LLM guard (detection only — never blocks the call itself).
        let guard_state = deps.guardrail.check_pre_llm(&system_prompt.to_plain_text());

        let request = ChatRequest {
            model: deps.model.to_string(),
            system: system_prompt.to_plain_text(),
            system_prompt: Some(system_prompt),
            messages: provider_messages,
            max_tokens: deps.compaction_config.reserved_output_tokens,
            stream: true,
            thinking: None,
            tools: tools_schema,
            raw_messages: None,
        };

        let (stream_tx, mut stream_rx) = mpsc::channel::<StreamEvent>(32);
        let send_task = deps.provider.send_stream(&request, stream_tx);

        let mut assistant_text = String::new();
        let mut tool_calls: Vec<(String, String, serde_json::Value)> = Vec::new();

        let drain = async {
            while let Some(event) = stream_rx.recv().await {
                match event {
                    StreamEvent::TextDelta { text } => {
                        assistant_text.push_str(&text);
                        let _ = tx.send(AgentEvent::TextChunk { text }).await;
                    }
                    StreamEvent::ToolUse { id, name, input } => {
                        tool_calls.push((id, name, input));
                    }
                    StreamEvent::Done { .. } | StreamEvent::Thinking { .. } | StreamEvent::Error { .. } => {}
                }
            }
        };
        let (send_result, ()) = tokio::join!(send_task, drain);
        send_result?;

        if tool_calls.is_empty() {
            // No tool calls: append the assistant text and terminate normally.
            deps.sessions.append_message(session_id, lock_token, "assistant", &assistant_text, None, Some(deps.model))?;
            return Ok(());
        }

        // Tool calls present: gate each one, execute the allowed ones.
        if !assistant_text.is_empty() {
            deps.sessions.append_message(session_id, lock_token, "assistant", &assistant_text, None, Some(deps.model))?;
        }

        for (call_id, tool_name, raw_input) in &tool_calls {
            let tool_result = handle_tool_call(deps, &guard_state, mode, call_id, tool_name, raw_input, tx).await;
            let result_text = serde_json::to_string(&json!({ "call_id": call_id, "tool_name": tool_name, "result": tool_result })).unwrap_or_default();
            deps.sessions.append_message(session_id, lock_token, "tool", &result_text, None, None)?;
        }

        let (new_compacted, new_history) = deps.sessions.get_effective_history(session_id)?;
        compacted_context = new_compacted;
        history = new_history;
    }

    // Iterations exhausted.
    let _ = tx
        .send(AgentEvent::TextChunk {
            text: format!("[reached the {MAX_TOOL_ITERATIONS}-iteration tool-call cap for this turn; stopping here]"),
        })
        .await;
    Ok(())
}

/// Gate and, if allowed, execute a single tool call. Always returns a
/// JSON-serializable result string — never panics, never skips persistence.
async fn handle_tool_call(
    deps: &AgentLoopDeps<'_>,
    guard_state: &crate::guardrail::GuardCheckResult,
    mode: ToolMode,
    call_id: &str,
    tool_name: &str,
    raw_input: &serde_json::Value,
    tx: &mpsc::Sender<AgentEvent>,
) -> serde_json::Value {
    let _ = tx
        .send(AgentEvent::ToolCall { call_id: call_id.to_string(), tool_name: tool_name.to_string(), arguments: raw_input.clone() })
        .await;

    let Some(tool) = deps.tools.get(tool_name) else {
        // Unknown tool: synthesize an error result, but do NOT emit tool_denied.
        return json!({ "is_error": true, "error_code": "UNKNOWN_TOOL", "message": format!("unknown tool: {tool_name}") });
    };

    if !deps.tools.check_mode(tool_name, mode) {
        let _ = tx
            .send(AgentEvent::ToolDenied {
                call_id: call_id.to_string(),
                tool_name: tool_name.to_string(),
                mode,
                error_code: "MODE_DENIED".to_string(),
                message: format!("tool '{tool_name}' is not permitted in mode '{mode}'"),
                next_action: "switch to a mode that permits this tool, or choose a different tool".to_string(),
            })
            .await;
        return json!({ "is_error": true, "error_code": "MODE_DENIED", "message": structured_error("MODE_DENIED", format!("tool '{tool_name}' not permitted in mode '{mode}'")) });
    }

    if let Some(blocked) = check_pre_tool_guard(guard_state, tool_name, tool.risk_level()) {
        let _ = tx
            .send(AgentEvent::ToolDenied {
                call_id: call_id.to_string(),
                tool_name: tool_name.to_string(),
                mode,
                error_code: blocked.error_code.clone(),
                message: blocked.detail.clone(),
                next_action: "the safety contract could not be verified for this turn; retry once the workspace anchors are restored".to_string(),
            })
            .await;
        return json!({ "is_error": true, "error_code": blocked.error_code, "message": blocked.detail });
    }

    let arguments = match parse_tool_arguments(raw_input) {
        Ok(v) => v,
        Err(message) => return json!({ "is_error": true, "error_code": "INVALID_ARGS", "message": message }),
    };

    let result = tool.execute(arguments).await;
    json!({ "is_error": result.is_error, "content": result.content })
}

/// Bridge compaction's memory-flush candidates into the daily-notes writer,
/// filtering by the configured confidence floor and tagging every write
/// `compaction_flush` so the indexer's source type reflects where it came
/// from. Best-effort: a write failure is logged and the remaining
/// candidates still get a chance.
fn bridge_flush_candidates(
    deps: &AgentLoopDeps<'_>,
    scope_key: &str,
    session_id: &str,
    candidates: &[crate::memory_flush::MemoryFlushCandidate],
) {
    let today = chrono::Utc::now().date_naive();
    for candidate in candidates {
        if candidate.confidence < deps.memory_config.flush_min_confidence || candidate.candidate_text.is_empty() {
            continue;
        }
        let entry = NoteEntry {
            source_type: "compaction_flush",
            scope_key,
            title: None,
            content: &candidate.candidate_text,
        };
        match deps.memory_writer.append(today, &entry, deps.memory_indexer) {
            Ok(()) => {}
            Err(neomagi_memory::daily_notes::MemoryWriteError::BudgetExceeded { .. }) => {
                warn!(session_id, "daily_note_budget_exceeded, stopping flush for this turn");
                break;
            }
            Err(e) => warn!(session_id, error = %e, "memory_flush_write_failed"),
        }
    }
}

fn to_provider_messages(history: &[StoredMessage]) -> Vec<ProviderMessage> {
    history
        .iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .map(|m| ProviderMessage {
            role: if m.role == "user" { Role::User } else { Role::Assistant },
            content: m.content.clone(),
        })
        .collect()
}
