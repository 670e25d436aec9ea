use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Protocol constants — must match OpenClaw wire protocol exactly
pub const PROTOCOL_VERSION: u32 = 3;
pub const DEFAULT_PORT: u16 = 18789;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024; // 128 KB hard cap per frame
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024; // 1 MB: slow consumer threshold
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // close if client doesn't auth in 10s
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30; // tick event cadence

/// Top-level config (neomagi.toml + NEOMAGI_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeoMagiConfig {
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub session_mode: SessionModeConfig,
}

/// Session lease claiming (C3 Session Store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// TTL for a claimed session lock, in seconds. A dispatch that crashes
    /// mid-turn self-heals once this elapses — no manual unlock needed.
    #[serde(default = "default_claim_ttl_seconds")]
    pub claim_ttl_seconds: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            claim_ttl_seconds: default_claim_ttl_seconds(),
        }
    }
}

fn default_claim_ttl_seconds() -> i64 {
    120
}

/// Spend gate (C11 Budget Gate). Amounts are EUR with 6 decimal places of
/// precision, represented as fixed-point micro-euros at the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_budget_warn_eur")]
    pub warn_eur: f64,
    #[serde(default = "default_budget_stop_eur")]
    pub stop_eur: f64,
    #[serde(default = "default_budget_reserve_eur")]
    pub default_reserve_eur: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            warn_eur: default_budget_warn_eur(),
            stop_eur: default_budget_stop_eur(),
            default_reserve_eur: default_budget_reserve_eur(),
        }
    }
}

impl BudgetConfig {
    /// Mirrors the Python settings validator: stop must exceed warn, and the
    /// default per-turn reservation must fit inside the stop ceiling.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.stop_eur <= self.warn_eur {
            return Err(crate::error::NeoMagiError::Config(format!(
                "budget.stop_eur ({}) must be greater than budget.warn_eur ({})",
                self.stop_eur, self.warn_eur
            )));
        }
        if self.default_reserve_eur <= 0.0 || self.default_reserve_eur > self.stop_eur {
            return Err(crate::error::NeoMagiError::Config(format!(
                "budget.default_reserve_eur ({}) must be in (0, stop_eur]",
                self.default_reserve_eur
            )));
        }
        Ok(())
    }
}

fn default_budget_warn_eur() -> f64 {
    5.0
}
fn default_budget_stop_eur() -> f64 {
    10.0
}
fn default_budget_reserve_eur() -> f64 {
    0.50
}

/// Context compaction (C10 Compaction Engine) and the token budget it acts on
/// (C1/C2 Token Counter / Budget Tracker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_context_limit")]
    pub context_limit: u32,
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
    #[serde(default = "default_compact_ratio")]
    pub compact_ratio: f64,
    #[serde(default = "default_reserved_output_tokens")]
    pub reserved_output_tokens: u32,
    #[serde(default = "default_safety_margin_tokens")]
    pub safety_margin_tokens: u32,
    #[serde(default = "default_min_preserved_turns")]
    pub min_preserved_turns: u32,
    #[serde(default = "default_flush_timeout_s")]
    pub flush_timeout_s: f64,
    #[serde(default = "default_compact_timeout_s")]
    pub compact_timeout_s: f64,
    #[serde(default = "default_max_flush_candidates")]
    pub max_flush_candidates: u32,
    #[serde(default = "default_max_candidate_text_bytes")]
    pub max_candidate_text_bytes: usize,
    #[serde(default = "default_max_compactions_per_request")]
    pub max_compactions_per_request: u32,
    #[serde(default = "default_summary_temperature")]
    pub summary_temperature: f64,
    #[serde(default = "bool_true")]
    pub anchor_retry_enabled: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_limit: default_context_limit(),
            warn_ratio: default_warn_ratio(),
            compact_ratio: default_compact_ratio(),
            reserved_output_tokens: default_reserved_output_tokens(),
            safety_margin_tokens: default_safety_margin_tokens(),
            min_preserved_turns: default_min_preserved_turns(),
            flush_timeout_s: default_flush_timeout_s(),
            compact_timeout_s: default_compact_timeout_s(),
            max_flush_candidates: default_max_flush_candidates(),
            max_candidate_text_bytes: default_max_candidate_text_bytes(),
            max_compactions_per_request: default_max_compactions_per_request(),
            summary_temperature: default_summary_temperature(),
            anchor_retry_enabled: true,
        }
    }
}

impl CompactionConfig {
    /// Mirrors the Python `CompactionSettings` validator.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !(0.0..1.0).contains(&self.warn_ratio) {
            return Err(crate::error::NeoMagiError::Config(
                "compaction.warn_ratio must be in [0, 1)".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.compact_ratio) {
            return Err(crate::error::NeoMagiError::Config(
                "compaction.compact_ratio must be in [0, 1]".to_string(),
            ));
        }
        if self.compact_ratio <= self.warn_ratio {
            return Err(crate::error::NeoMagiError::Config(
                "compaction.compact_ratio must exceed compaction.warn_ratio".to_string(),
            ));
        }
        if self.min_preserved_turns == 0 {
            return Err(crate::error::NeoMagiError::Config(
                "compaction.min_preserved_turns must be >= 1".to_string(),
            ));
        }
        let reserved = self.reserved_output_tokens + self.safety_margin_tokens;
        if reserved >= self.context_limit {
            return Err(crate::error::NeoMagiError::Config(
                "compaction.reserved_output_tokens + safety_margin_tokens must be < context_limit"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Usable budget after reserving space for the model's own output and a
    /// fixed safety margin.
    pub fn usable_budget(&self) -> u32 {
        self.context_limit
            .saturating_sub(self.reserved_output_tokens)
            .saturating_sub(self.safety_margin_tokens)
    }

    pub fn warn_threshold(&self) -> u32 {
        (self.usable_budget() as f64 * self.warn_ratio) as u32
    }

    pub fn compact_threshold(&self) -> u32 {
        (self.usable_budget() as f64 * self.compact_ratio) as u32
    }
}

fn default_context_limit() -> u32 {
    180_000
}
fn default_warn_ratio() -> f64 {
    0.70
}
fn default_compact_ratio() -> f64 {
    0.85
}
fn default_reserved_output_tokens() -> u32 {
    8_000
}
fn default_safety_margin_tokens() -> u32 {
    4_000
}
fn default_min_preserved_turns() -> u32 {
    4
}
fn default_flush_timeout_s() -> f64 {
    20.0
}
fn default_compact_timeout_s() -> f64 {
    45.0
}
fn default_max_flush_candidates() -> u32 {
    40
}
fn default_max_candidate_text_bytes() -> usize {
    4_000
}
fn default_max_compactions_per_request() -> u32 {
    1
}
fn default_summary_temperature() -> f64 {
    0.2
}

/// Memory writer/indexer (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_workspace_path")]
    pub workspace_path: String,
    #[serde(default = "default_max_daily_note_bytes")]
    pub max_daily_note_bytes: usize,
    #[serde(default = "default_daily_notes_load_days")]
    pub daily_notes_load_days: u32,
    #[serde(default = "default_daily_notes_max_tokens")]
    pub daily_notes_max_tokens: u32,
    #[serde(default = "default_flush_min_confidence")]
    pub flush_min_confidence: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            workspace_path: default_workspace_path(),
            max_daily_note_bytes: default_max_daily_note_bytes(),
            daily_notes_load_days: default_daily_notes_load_days(),
            daily_notes_max_tokens: default_daily_notes_max_tokens(),
            flush_min_confidence: default_flush_min_confidence(),
        }
    }
}

fn default_workspace_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.neomagi/workspace", home)
}
fn default_max_daily_note_bytes() -> usize {
    256 * 1024
}
fn default_daily_notes_load_days() -> u32 {
    7
}
fn default_daily_notes_max_tokens() -> u32 {
    6_000
}
fn default_flush_min_confidence() -> f64 {
    0.6
}

/// Default tool mode for newly created sessions and how DM-style channels
/// derive their scope key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionModeConfig {
    #[serde(default = "default_session_mode")]
    pub default_mode: String,
    #[serde(default = "default_dm_scope")]
    pub dm_scope: String,
}

impl Default for SessionModeConfig {
    fn default() -> Self {
        Self {
            default_mode: default_session_mode(),
            dm_scope: default_dm_scope(),
        }
    }
}

impl SessionModeConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        self.default_mode.parse::<crate::types::ToolMode>().map_err(|e| {
            crate::error::NeoMagiError::Config(format!("session_mode.default_mode: {e}"))
        })?;
        if !matches!(self.dm_scope.as_str(), "main" | "per-channel-peer" | "per-peer") {
            return Err(crate::error::NeoMagiError::Config(
                "session_mode.dm_scope must be one of 'main', 'per-channel-peer', 'per-peer'"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn default_session_mode() -> String {
    "chat_safe".to_string()
}
fn default_dm_scope() -> String {
    "per-channel-peer".to_string()
}

/// Update subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Check for updates on server start (default: true).
    /// Override with env var: NEOMAGI_UPDATE_CHECK_ON_START=false
    #[serde(default = "bool_true")]
    pub check_on_start: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            check_on_start: true,
        }
    }
}

impl Default for NeoMagiConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            gateway: GatewayConfig {
                port: DEFAULT_PORT,
                bind: DEFAULT_BIND.to_string(),
                auth: AuthConfig {
                    mode: AuthMode::Token,
                    token: Some("change-me".to_string()),
                    password: None,
                },
            },
            agent: AgentConfig {
                model: "claude-sonnet-4-6".to_string(),
                soul_path: None,
            },
            providers: ProvidersConfig::default(),
            channels: ChannelsConfig::default(),
            webhooks: WebhooksConfig::default(),
            update: UpdateConfig::default(),
            session: SessionConfig::default(),
            budget: BudgetConfig::default(),
            compaction: CompactionConfig::default(),
            memory: MemoryConfig::default(),
            session_mode: SessionModeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    Token,
    Password,
    Tailscale,
    DeviceToken,
    TrustedProxy,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    pub soul_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
    pub openai: Option<OpenAiProviderConfig>,
    pub ollama: Option<OllamaConfig>,
    pub copilot: Option<CopilotConfig>,
    pub qwen_oauth: Option<QwenOAuthConfig>,
    pub bedrock: Option<BedrockConfig>,
    pub vertex: Option<VertexConfig>,
    /// Additional OpenAI-compatible providers. Each entry can reference a
    /// well-known provider ID (e.g. "groq", "deepseek") or define a fully
    /// custom endpoint. Providers are tried in order after the primary slots.
    #[serde(default)]
    pub openai_compat: Vec<OpenAiCompatEntry>,
    /// Delegates to the Claude Code CLI instead of calling a provider API
    /// directly. When set explicitly it always wins; otherwise the gateway
    /// may still auto-detect it (no other provider configured, no known API
    /// key env vars, `claude` present in `PATH`).
    pub claude_cli: Option<ClaudeCliConfig>,
}

/// Claude Code CLI provider — delegates tool execution to `claude -p` itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeCliConfig {
    /// Binary name or path to invoke. Defaults to "claude" when not set.
    pub command: Option<String>,
    /// Explicit path to the `neomagi-gateway` binary for MCP bridge
    /// registration. Auto-detected from `~/.neomagi/neomagi-gateway` when unset.
    pub mcp_bridge: Option<String>,
}

/// A single OpenAI-compatible provider entry.
///
/// Well-known provider IDs are resolved automatically:
/// `groq`, `deepseek`, `openrouter`, `xai`, `mistral`, `perplexity`,
/// `together`, `fireworks`, `cerebras`, `sambanova`, `hyperbolic`,
/// `novita`, `lepton`, `corethink`, `featherless`, `requesty`, `glama`,
/// `chutes`, `cohere`, `moonshot`, `glm`, `doubao`, `qwen`, `zai`,
/// `yi`, `minimax`, `hunyuan`, `stepfun`, `lmstudio`, `llamacpp`,
/// `localai`, `litellm`.
///
/// For unknown IDs, `base_url` is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatEntry {
    /// Provider identifier — matches a known ID or a custom label.
    pub id: String,
    /// API key for this provider.
    pub api_key: String,
    /// Base URL (without trailing slash). Auto-filled from registry for known IDs.
    /// Required for custom/unknown providers.
    pub base_url: Option<String>,
    /// Override the chat completions path. Auto-filled from registry.
    /// Defaults to "/v1/chat/completions" when not in registry.
    pub chat_path: Option<String>,
    /// Override the model for requests routed to this provider.
    /// Falls back to `agent.model` when not set.
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
}

/// GitHub Copilot provider — reads a long-lived GitHub access token from file.
/// The token is exchanged for short-lived Copilot API keys at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotConfig {
    /// Path to file containing the GitHub access token (written by setup.sh).
    pub token_path: String,
}

/// Qwen OAuth provider — reads OAuth credentials (access + refresh token) from file.
/// Tokens are auto-refreshed at runtime when expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QwenOAuthConfig {
    /// Path to JSON credentials file (written by setup.sh).
    pub credentials_path: String,
}

/// AWS Bedrock provider — uses SigV4 authentication.
/// Credentials from AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY env vars
/// or ~/.aws/credentials file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedrockConfig {
    /// AWS region (e.g. "us-east-1").
    pub region: String,
    /// Optional AWS credentials profile name (default: "default").
    pub profile: Option<String>,
}

/// Google Vertex AI provider — uses service account JWT authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexConfig {
    /// Path to GCP service account JSON key file.
    pub key_file: String,
    /// GCP project ID. Auto-detected from key file if not set.
    pub project_id: Option<String>,
    /// GCP region (default: "us-central1").
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub bot_token: String,
    /// When true, guild messages are only processed when the bot is @mentioned.
    /// Defaults to false (respond to all messages in channels).
    #[serde(default)]
    pub require_mention: bool,
    /// When true, direct messages (DMs) are accepted.
    /// Defaults to true.
    #[serde(default = "bool_true")]
    pub dm_allowed: bool,
}

fn bool_true() -> bool {
    true
}

/// Authentication mode for an incoming webhook source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookAuthMode {
    /// HMAC-SHA256 over the raw request body (GitHub-style X-Hub-Signature-256).
    HmacSha256,
    /// Static bearer token in the Authorization header.
    BearerToken,
    /// No authentication — use only for internal/trusted networks.
    None,
}

/// Configuration for a single webhook source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSourceConfig {
    /// Identifier used in the route, e.g. "github" → POST /webhooks/github.
    pub name: String,
    /// HMAC signing secret or bearer token value.
    pub secret: Option<String>,
    /// How the incoming request should be authenticated.
    pub auth_mode: WebhookAuthMode,
}

/// Top-level webhooks subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhooksConfig {
    /// When false the /webhooks/:source route returns 404.
    #[serde(default)]
    pub enabled: bool,
    /// List of allowed webhook sources and their auth settings.
    #[serde(default)]
    pub sources: Vec<WebhookSourceConfig>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.neomagi/neomagi.db", home)
}

impl NeoMagiConfig {
    /// Load config from a TOML file with NEOMAGI_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.neomagi/neomagi.toml  (native)
    ///   3. ~/.openclaw/openclaw.json  (migration path — Phase 2)
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: NeoMagiConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("NEOMAGI_").split("_"))
            .extract()
            .map_err(|e| crate::error::NeoMagiError::Config(e.to_string()))?;

        config.budget.validate()?;
        config.compaction.validate()?;
        config.session_mode.validate()?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.neomagi/neomagi.toml", home)
}
