use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Outbound text is split into chunks no larger than this (bytes).
/// Sized for the smallest platform limit among the supported channels.
pub const DEFAULT_CHUNK_LIMIT: usize = 4000;
/// Transport retries per outbound chunk.
pub const SEND_RETRIES: u32 = 3;
/// Delay between outbound retries.
pub const SEND_RETRY_DELAY_MS: u64 = 1000;
/// Typing indicator refresh cadence while a turn is running.
pub const TYPING_INTERVAL_SECS: u64 = 4;

/// Top-level config (courier.toml + COURIER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    /// LLM endpoints in any order; the pool sorts by `priority`.
    #[serde(default)]
    pub endpoints: Vec<EndpointEntry>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// System prompt prepended to every turn.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Hard cap on tool-loop iterations per turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// When false the guardrail never forces tool use.
    #[serde(default = "bool_true")]
    pub guard_enabled: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_tokens: default_max_tokens(),
            max_iterations: default_max_iterations(),
            guard_enabled: true,
        }
    }
}

/// One LLM endpoint as written in courier.toml.
///
/// Entries with an empty `api_key` are skipped at pool construction so a
/// half-configured file still starts with whatever endpoints are usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointEntry {
    pub name: String,
    /// Wire dialect: "native" (messages API) or "openai" (chat completions).
    #[serde(default = "default_endpoint_kind")]
    pub kind: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    /// Lower is preferred. Ties keep file order.
    #[serde(default)]
    pub priority: u32,
    /// Provider-specific request flags merged into the body verbatim
    /// (e.g. `enable_thinking = true` for Qwen-family backends).
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,
    /// Directory for downloaded media caches.
    #[serde(default = "default_media_dir")]
    pub media_dir: String,
    /// Directory holding `{date}_report.json` self-check reports.
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
    /// Concurrent media downloads per inbound message.
    #[serde(default = "default_media_concurrency")]
    pub media_concurrency: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            chunk_limit: default_chunk_limit(),
            media_dir: default_media_dir(),
            report_dir: default_report_dir(),
            media_concurrency: default_media_concurrency(),
        }
    }
}

/// Stream reply state machine tuning.
///
/// Both values are empirical parameters of the platform behaviour, not
/// protocol constants; tests compress them to milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Grace period after the agent marks a stream finished, during which
    /// late image enqueues still attach to the final reply.
    #[serde(default = "default_settle_secs")]
    pub settle_delay_secs: u64,
    /// Hard wall-clock limit on a stream session (5m30s).
    #[serde(default = "default_stream_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: default_settle_secs(),
            timeout_secs: default_stream_timeout_secs(),
        }
    }
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

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            endpoints: Vec::new(),
            gateway: GatewayConfig::default(),
            stream: StreamConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl CourierConfig {
    /// Load config from a TOML file with COURIER_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.courier/courier.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CourierConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("COURIER_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn bool_true() -> bool {
    true
}
fn default_system_prompt() -> String {
    "You are Courier, an autonomous assistant reachable over instant \
     messaging. Prefer acting with tools over describing what you would do."
        .to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_iterations() -> u32 {
    30
}
fn default_endpoint_kind() -> String {
    "native".to_string()
}
fn default_chunk_limit() -> usize {
    DEFAULT_CHUNK_LIMIT
}
fn default_media_concurrency() -> usize {
    4
}
fn default_settle_secs() -> u64 {
    8
}
fn default_stream_timeout_secs() -> u64 {
    330
}

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}
fn default_media_dir() -> String {
    format!("{}/.courier/media", home_dir())
}
fn default_report_dir() -> String {
    format!("{}/.courier/reports", home_dir())
}
fn default_db_path() -> String {
    format!("{}/.courier/courier.db", home_dir())
}
fn default_config_path() -> String {
    format!("{}/.courier/courier.toml", home_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CourierConfig::default();
        assert_eq!(cfg.agent.max_iterations, 30);
        assert_eq!(cfg.stream.settle_delay_secs, 8);
        assert_eq!(cfg.stream.timeout_secs, 330);
        assert_eq!(cfg.gateway.chunk_limit, 4000);
        assert!(cfg.endpoints.is_empty());
    }

    #[test]
    fn endpoint_entry_parses_with_defaults() {
        let entry: EndpointEntry = toml::from_str(
            r#"
            name = "primary"
            base_url = "https://api.example.com"
            model = "big-model-1"
            api_key = "sk-test"
            "#,
        )
        .expect("parse failed");
        assert_eq!(entry.kind, "native");
        assert_eq!(entry.priority, 0);
        assert!(entry.extras.is_empty());
    }
}
