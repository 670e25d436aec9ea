//! Provider registry — maps a provider name to its ready-to-use provider
//! adapter and canonical model name. Built once at startup from config and
//! never mutated afterwards; the dispatch orchestrator only ever reads it.

use std::collections::HashMap;

use crate::provider::LlmProvider;

/// A provider slot as seen by the dispatcher: the adapter to call plus the
/// model name to put on every `ChatRequest` sent through it.
pub struct ProviderEntry {
    pub provider: Box<dyn LlmProvider>,
    pub model: String,
}

impl ProviderEntry {
    pub fn new(provider: Box<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self { provider, model: model.into() }
    }
}

/// Read-only provider catalog, keyed by provider name. `get(None)` and
/// `get(Some(unknown_name))` both fall back to the configured default
/// provider — callers that need to distinguish "unknown provider" from
/// "used the default" should check `name` against `available_providers()`
/// first and surface `PROVIDER_NOT_AVAILABLE` themselves.
pub struct ProviderRegistry {
    entries: HashMap<String, ProviderEntry>,
    default_name: String,
}

impl ProviderRegistry {
    /// Build a registry from a name -> entry map and a default provider
    /// name. Fails if the map is empty or the default name isn't among the
    /// entries — both are startup configuration errors, not runtime ones.
    pub fn new(entries: HashMap<String, ProviderEntry>, default_name: impl Into<String>) -> Result<Self, String> {
        if entries.is_empty() {
            return Err("provider registry requires at least one provider".to_string());
        }
        let default_name = default_name.into();
        if !entries.contains_key(&default_name) {
            return Err(format!("default provider '{default_name}' is not among the registered providers"));
        }
        Ok(Self { entries, default_name })
    }

    /// Resolve a provider by name, falling back to the default provider
    /// when `name` is `None`. Returns `None` only when `name` is `Some` and
    /// not a registered provider — the dispatcher surfaces this as
    /// `PROVIDER_NOT_AVAILABLE`.
    pub fn get(&self, name: Option<&str>) -> Option<&ProviderEntry> {
        match name {
            Some(n) => self.entries.get(n),
            None => self.entries.get(&self.default_name),
        }
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    pub fn default_provider(&self) -> &ProviderEntry {
        self.entries
            .get(&self.default_name)
            .expect("default provider is validated to exist at construction")
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn available_providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatRequest, ChatResponse, ProviderError};
    use async_trait::async_trait;

    struct Stub(&'static str);

    #[async_trait]
    impl LlmProvider for Stub {
        fn name(&self) -> &str {
            self.0
        }
        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: "ok".to_string(),
                model: req.model.clone(),
                tokens_in: 1,
                tokens_out: 1,
                stop_reason: "stop".to_string(),
                tool_calls: Vec::new(),
            })
        }
    }

    fn registry() -> ProviderRegistry {
        let mut entries = HashMap::new();
        entries.insert("anthropic".to_string(), ProviderEntry::new(Box::new(Stub("anthropic")), "claude-sonnet"));
        entries.insert("openai".to_string(), ProviderEntry::new(Box::new(Stub("openai")), "gpt-4o"));
        ProviderRegistry::new(entries, "anthropic").unwrap()
    }

    #[test]
    fn get_none_falls_back_to_default() {
        let reg = registry();
        assert_eq!(reg.get(None).unwrap().provider.name(), "anthropic");
    }

    #[test]
    fn get_named_returns_that_provider() {
        let reg = registry();
        assert_eq!(reg.get(Some("openai")).unwrap().provider.name(), "openai");
    }

    #[test]
    fn get_unknown_name_returns_none() {
        let reg = registry();
        assert!(reg.get(Some("does-not-exist")).is_none());
    }

    #[test]
    fn construction_rejects_missing_default() {
        let mut entries = HashMap::new();
        entries.insert("openai".to_string(), ProviderEntry::new(Box::new(Stub("openai")), "gpt-4o"));
        assert!(ProviderRegistry::new(entries, "anthropic").is_err());
    }

    #[test]
    fn construction_rejects_empty_map() {
        assert!(ProviderRegistry::new(HashMap::new(), "anthropic").is_err());
    }

    #[test]
    fn available_providers_is_sorted() {
        let reg = registry();
        assert_eq!(reg.available_providers(), vec!["anthropic", "openai"]);
    }
}
