//! Dispatch Orchestrator (C12): the request-lifecycle composition the
//! gateway's WS `chat.send`/`chat.history` handlers drive.
//!
//! Composes provider routing, session claim/reload, budget reservation, the
//! Agent Loop, and best-effort settle/release into one async call per
//! request. Distinct from [`crate::pipeline::MessageContext`]-generic
//! per-channel processing — this path is for gateway dispatch specifically,
//! where sessions are fenced and budgeted.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use neomagi_budget::{BudgetError, BudgetGate};
use neomagi_sessions::SessionError;

use crate::pipeline::agent_loop::{run_turn, AgentEvent, AgentLoopDeps, AgentLoopError};
use crate::provider_registry::ProviderRegistry;
use crate::scope::SessionIdentity;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("provider not available: {0}")]
    ProviderNotAvailable(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    AgentLoop(#[from] AgentLoopError),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::ProviderNotAvailable(_) => "PROVIDER_NOT_AVAILABLE",
            DispatchError::Session(e) => e.code(),
            DispatchError::Budget(e) => e.code(),
            DispatchError::AgentLoop(e) => e.code(),
        }
    }
}

/// Extract the eval-run id grouping key from a session id formatted as
/// `m6_eval_{provider}_{task}_{timestamp}`. Online sessions (any other
/// shape) carry no eval-run id — budget reporting groups them under the
/// session id itself instead.
pub fn eval_run_id(session_id: &str) -> Option<&str> {
    session_id.strip_prefix("m6_eval_").map(|_| session_id)
}

/// Everything [`dispatch`] needs to run one request, beyond the per-request
/// arguments. Built once per gateway and shared across dispatches.
pub struct Dispatcher<'a> {
    pub sessions: &'a neomagi_sessions::SessionManager,
    pub budget: &'a BudgetGate,
    pub providers: &'a ProviderRegistry,
    pub claim_ttl_seconds: i64,
    pub default_reserve_eur: f64,
}

/// Run the full request lifecycle for one user message and forward every
/// [`AgentEvent`] through `tx` as the Agent Loop produces it.
///
/// Order, per spec §4.8: route provider -> claim session -> force-reload ->
/// reserve budget -> run the Agent Loop -> best-effort settle -> best-effort
/// release. Settle/release failures are logged but never override the Agent
/// Loop's own outcome.
#[instrument(skip(dispatcher, deps_tools, deps_guardrail, deps_compaction_config, deps_memory_config, deps_memory_writer, deps_memory_indexer, tx, identity), fields(session_id, provider))]
#[allow(clippy::too_many_arguments)]
pub async fn dispatch(
    dispatcher: &Dispatcher<'_>,
    session_id: &str,
    provider_name: Option<&str>,
    identity: Option<&SessionIdentity>,
    dm_scope: &str,
    user_message: &str,
    deps_tools: &crate::tools::ToolRegistry,
    deps_guardrail: &crate::guardrail::Guardrail,
    deps_compaction_config: &neomagi_core::config::CompactionConfig,
    deps_memory_config: &neomagi_core::config::MemoryConfig,
    deps_memory_writer: &neomagi_memory::daily_notes::DailyNotesWriter,
    deps_memory_indexer: &neomagi_memory::daily_notes::DailyNotesIndexer,
    workspace_dir: &std::path::Path,
    prompt_builder: &crate::prompt::PromptBuilder,
    tx: &mpsc::Sender<AgentEvent>,
) -> Result<(), DispatchError> {
    // 1. Provider routing.
    let entry = dispatcher
        .providers
        .get(provider_name)
        .ok_or_else(|| DispatchError::ProviderNotAvailable(provider_name.unwrap_or("<default>").to_string()))?;

    // 2. Claim the session.
    let lock_token = dispatcher.sessions.try_claim_session(session_id, dispatcher.claim_ttl_seconds)?;

    // From here on, every early return must release the claim before
    // propagating, since the lease is only a TTL backstop otherwise.
    let result = dispatch_inner(
        dispatcher,
        session_id,
        &lock_token,
        entry,
        identity,
        dm_scope,
        user_message,
        deps_tools,
        deps_guardrail,
        deps_compaction_config,
        deps_memory_config,
        deps_memory_writer,
        deps_memory_indexer,
        workspace_dir,
        prompt_builder,
        tx,
    )
    .await;

    if let Err(e) = dispatcher.sessions.release_session(session_id, &lock_token) {
        warn!(session_id, error = %e, "dispatch_release_session_failed");
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_inner(
    dispatcher: &Dispatcher<'_>,
    session_id: &str,
    lock_token: &str,
    entry: &crate::provider_registry::ProviderEntry,
    identity: Option<&SessionIdentity>,
    dm_scope: &str,
    user_message: &str,
    deps_tools: &crate::tools::ToolRegistry,
    deps_guardrail: &crate::guardrail::Guardrail,
    deps_compaction_config: &neomagi_core::config::CompactionConfig,
    deps_memory_config: &neomagi_core::config::MemoryConfig,
    deps_memory_writer: &neomagi_memory::daily_notes::DailyNotesWriter,
    deps_memory_indexer: &neomagi_memory::daily_notes::DailyNotesIndexer,
    workspace_dir: &std::path::Path,
    prompt_builder: &crate::prompt::PromptBuilder,
    tx: &mpsc::Sender<AgentEvent>,
) -> Result<(), DispatchError> {
    // 3. Force-reload the session row so a write from another worker (e.g. a
    // concurrent compaction from a previous, since-released dispatch) is
    // visible before this turn reads effective history.
    dispatcher
        .sessions
        .get_by_id(session_id)?
        .ok_or_else(|| SessionError::NotFound { key: session_id.to_string() })?;

    // 4. Reserve a fixed per-request cost up front; the true cost is settled
    // once the Agent Loop's underlying provider calls report actual usage.
    let reservation = dispatcher.budget.reserve(session_id, dispatcher.default_reserve_eur)?;

    let deps = AgentLoopDeps {
        sessions: dispatcher.sessions,
        provider: entry.provider.as_ref(),
        model: &entry.model,
        prompt_builder,
        tools: deps_tools,
        guardrail: deps_guardrail,
        compaction_config: deps_compaction_config,
        memory_config: deps_memory_config,
        memory_writer: deps_memory_writer,
        memory_indexer: deps_memory_indexer,
        workspace_dir,
        max_compactions_per_request: deps_compaction_config.max_compactions_per_request,
    };

    // 5. Run the Agent Loop, forwarding every event as it happens.
    let loop_result = run_turn(&deps, session_id, lock_token, identity, dm_scope, tx, user_message).await;

    // 6. Settle best-effort. A settle failure must never mask the Agent
    // Loop's own outcome — log it with both ids for later reconciliation.
    match &loop_result {
        Ok(()) => {
            if let Err(e) = dispatcher.budget.settle(&reservation.id, dispatcher.default_reserve_eur) {
                error!(session_id, reservation_id = %reservation.id, error = %e, "dispatch_settle_failed");
            }
        }
        Err(_) => {
            if let Err(e) = dispatcher.budget.release(&reservation.id) {
                error!(session_id, reservation_id = %reservation.id, error = %e, "dispatch_release_reservation_failed");
            }
        }
    }

    if let Some(run_id) = eval_run_id(session_id) {
        info!(session_id, eval_run_id = run_id, "dispatch_eval_run_grouping");
    }

    loop_result.map_err(DispatchError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_run_id_extracted_from_prefixed_session() {
        assert_eq!(eval_run_id("m6_eval_anthropic_task1_20260101"), Some("m6_eval_anthropic_task1_20260101"));
    }

    #[test]
    fn eval_run_id_absent_for_online_sessions() {
        assert_eq!(eval_run_id("user:u1:agent:main:main"), None);
    }
}
