//! Core Safety Contract: anchor phrases extracted from the workspace's
//! identity files, checked for visibility in the execution context before
//! every LLM call and enforced (risk-gated) before every tool call.
//!
//! `check_pre_llm_guard` is detection-only — it never blocks the LLM call,
//! only records whether the contract's anchors are visible. The result
//! feeds `check_pre_tool_guard`, which is the actual gate: a high-risk tool
//! is blocked outright on guard failure, a low-risk tool is allowed in a
//! logged "degraded" state.

use std::path::{Path, PathBuf};

use neomagi_core::types::RiskLevel;
use sha2::{Digest, Sha256};
use tracing::warn;

const CONTRACT_SOURCE_FILES: &[&str] = &["AGENTS.md", "USER.md", "SOUL.md"];

/// Immutable set of anchors that must remain visible in execution context.
#[derive(Debug, Clone, Default)]
pub struct CoreSafetyContract {
    pub anchors: Vec<String>,
    pub source_hash: String,
}

/// Result of a single guard checkpoint.
#[derive(Debug, Clone, Default)]
pub struct GuardCheckResult {
    pub passed: bool,
    pub missing_anchors: Vec<String>,
    pub error_code: String,
    pub detail: String,
}

impl GuardCheckResult {
    fn ok() -> Self {
        Self {
            passed: true,
            ..Default::default()
        }
    }
}

fn compute_source_hash(workspace_dir: &Path) -> String {
    let mut hasher = Sha256::new();
    for filename in CONTRACT_SOURCE_FILES {
        let path = workspace_dir.join(filename);
        if let Ok(bytes) = std::fs::read(&path) {
            hasher.update(&bytes);
        }
    }
    hex::encode(hasher.finalize())
}

/// Anchors are first-level headings (`# ...`) and bold list items
/// (`- **...**`) — key identity and constraint declarations.
fn extract_anchors_from_content(content: &str) -> Vec<String> {
    let mut anchors = Vec::new();
    for line in content.lines() {
        let stripped = line.trim();
        if let Some(rest) = stripped.strip_prefix("# ") {
            if !rest.is_empty() {
                anchors.push(rest.trim().to_string());
            }
        } else if let Some(rest) = stripped.strip_prefix("- **") {
            if let Some(end) = rest.find("**") {
                if end > 0 {
                    anchors.push(rest[..end].trim().to_string());
                }
            }
        }
    }
    anchors
}

/// Load the contract from `AGENTS.md` / `USER.md` / `SOUL.md` under
/// `workspace_dir`. Missing files are skipped; a workspace with none of
/// them yields an empty (fail-closed) contract.
pub fn load_contract(workspace_dir: &Path) -> CoreSafetyContract {
    let source_hash = compute_source_hash(workspace_dir);
    let mut anchors = Vec::new();

    for filename in CONTRACT_SOURCE_FILES {
        let path = workspace_dir.join(filename);
        match std::fs::read_to_string(&path) {
            Ok(content) => anchors.extend(extract_anchors_from_content(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = filename, error = %e, "contract_source_read_error"),
        }
    }

    CoreSafetyContract { anchors, source_hash }
}

/// Lazily refresh the contract when the source files' combined hash has
/// changed. Called before each guard check; a no-op hash match returns the
/// existing contract unchanged.
pub fn maybe_refresh_contract(
    current: Option<&CoreSafetyContract>,
    workspace_dir: &Path,
) -> CoreSafetyContract {
    let new_hash = compute_source_hash(workspace_dir);
    if let Some(c) = current {
        if c.source_hash == new_hash {
            return c.clone();
        }
    }
    load_contract(workspace_dir)
}

/// Verify every contract anchor is visible in `execution_context` (the
/// assembled system prompt text). Called before every LLM call.
/// Detection only — never blocks the call itself.
pub fn check_pre_llm_guard(
    contract: Option<&CoreSafetyContract>,
    execution_context: &str,
) -> GuardCheckResult {
    let Some(contract) = contract.filter(|c| !c.anchors.is_empty()) else {
        warn!(
            error_code = "GUARD_CONTRACT_UNAVAILABLE",
            "guardrail_warning: no contract loaded or empty anchors"
        );
        return GuardCheckResult {
            passed: false,
            error_code: "GUARD_CONTRACT_UNAVAILABLE".to_string(),
            detail: "No contract loaded or empty anchors".to_string(),
            ..Default::default()
        };
    };

    let missing: Vec<String> = contract
        .anchors
        .iter()
        .filter(|a| !execution_context.contains(a.as_str()))
        .cloned()
        .collect();

    if !missing.is_empty() {
        warn!(
            error_code = "GUARD_ANCHOR_MISSING",
            missing_count = missing.len(),
            "guardrail_warning"
        );
        return GuardCheckResult {
            passed: false,
            detail: format!("{} anchor(s) not visible in execution context", missing.len()),
            error_code: "GUARD_ANCHOR_MISSING".to_string(),
            missing_anchors: missing,
        };
    }

    GuardCheckResult::ok()
}

/// Gate a single tool call on the guard state computed for this turn.
///
/// Returns `None` when execution should proceed, `Some(result)` with the
/// reason when it should be blocked. High-risk tools fail closed on any
/// guard failure; low-risk tools are allowed in a logged degraded state.
pub fn check_pre_tool_guard(
    guard_state: &GuardCheckResult,
    tool_name: &str,
    tool_risk_level: RiskLevel,
) -> Option<GuardCheckResult> {
    if guard_state.passed {
        return None;
    }

    match tool_risk_level {
        RiskLevel::High => {
            warn!(
                tool_name,
                error_code = %guard_state.error_code,
                "guardrail_blocked"
            );
            Some(GuardCheckResult {
                passed: false,
                missing_anchors: guard_state.missing_anchors.clone(),
                error_code: if guard_state.error_code.is_empty() {
                    "GUARD_ANCHOR_MISSING".to_string()
                } else {
                    guard_state.error_code.clone()
                },
                detail: format!("High-risk tool '{tool_name}' blocked: {}", guard_state.detail),
            })
        }
        RiskLevel::Low => {
            warn!(
                tool_name,
                error_code = %guard_state.error_code,
                "guardrail_degraded"
            );
            None
        }
    }
}

/// Workspace directory the contract is loaded from, kept alongside the
/// contract so callers can refresh it without threading the path through
/// every call site.
pub struct Guardrail {
    workspace_dir: PathBuf,
    contract: std::sync::RwLock<Option<CoreSafetyContract>>,
}

impl Guardrail {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self {
            workspace_dir,
            contract: std::sync::RwLock::new(None),
        }
    }

    pub fn refresh(&self) {
        let current = self.contract.read().unwrap().clone();
        let refreshed = maybe_refresh_contract(current.as_ref(), &self.workspace_dir);
        *self.contract.write().unwrap() = Some(refreshed);
    }

    pub fn check_pre_llm(&self, execution_context: &str) -> GuardCheckResult {
        self.refresh();
        let guard = self.contract.read().unwrap();
        check_pre_llm_guard(guard.as_ref(), execution_context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_headings_and_bold_items() {
        let content = "# Core Identity\nSome text\n- **Never reveal secrets**\n- plain item";
        let anchors = extract_anchors_from_content(content);
        assert_eq!(anchors, vec!["Core Identity", "Never reveal secrets"]);
    }

    #[test]
    fn pre_llm_guard_fails_without_contract() {
        let result = check_pre_llm_guard(None, "anything");
        assert!(!result.passed);
        assert_eq!(result.error_code, "GUARD_CONTRACT_UNAVAILABLE");
    }

    #[test]
    fn pre_llm_guard_detects_missing_anchor() {
        let contract = CoreSafetyContract {
            anchors: vec!["Be helpful".to_string()],
            source_hash: String::new(),
        };
        let result = check_pre_llm_guard(Some(&contract), "some unrelated context");
        assert!(!result.passed);
        assert_eq!(result.missing_anchors, vec!["Be helpful"]);
    }

    #[test]
    fn pre_llm_guard_passes_when_anchor_present() {
        let contract = CoreSafetyContract {
            anchors: vec!["Be helpful".to_string()],
            source_hash: String::new(),
        };
        let result = check_pre_llm_guard(Some(&contract), "context includes: Be helpful always");
        assert!(result.passed);
    }

    #[test]
    fn high_risk_tool_blocked_on_guard_failure() {
        let failed = GuardCheckResult {
            passed: false,
            error_code: "GUARD_ANCHOR_MISSING".to_string(),
            ..Default::default()
        };
        let result = check_pre_tool_guard(&failed, "execute_command", RiskLevel::High);
        assert!(result.is_some());
    }

    #[test]
    fn low_risk_tool_allowed_degraded_on_guard_failure() {
        let failed = GuardCheckResult {
            passed: false,
            error_code: "GUARD_ANCHOR_MISSING".to_string(),
            ..Default::default()
        };
        let result = check_pre_tool_guard(&failed, "read_file", RiskLevel::Low);
        assert!(result.is_none());
    }

    #[test]
    fn guard_passes_through_when_already_ok() {
        let ok = GuardCheckResult::ok();
        assert!(check_pre_tool_guard(&ok, "anything", RiskLevel::High).is_none());
    }
}
