use std::time::Instant;

use courier_core::config::EndpointEntry;

/// Wire dialect spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Messages API: structured content blocks, separate system field.
    Native,
    /// Chat-completions compatible. Structured blocks are lowered to plain
    /// text on the way in — tool loops run text-only on these endpoints.
    OpenAiCompat,
}

/// One LLM access point plus its scheduling state.
///
/// Credentials are carried here, captured from config at startup; the pool
/// never reads process env during requests.
#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    pub name: String,
    pub kind: EndpointKind,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Lower is preferred.
    pub priority: u32,

    pub healthy: bool,
    pub last_probe: Option<Instant>,
    pub fail_count: u32,
    pub requests_ok: u64,
    pub requests_err: u64,
}

impl LlmEndpoint {
    /// Build from a config entry. Returns `None` for entries without
    /// credentials so a half-configured file still starts.
    pub fn from_entry(entry: &EndpointEntry) -> Option<Self> {
        if entry.api_key.trim().is_empty() {
            return None;
        }
        let kind = match entry.kind.as_str() {
            "openai" | "openai_compat" => EndpointKind::OpenAiCompat,
            _ => EndpointKind::Native,
        };
        Some(Self {
            name: entry.name.clone(),
            kind,
            base_url: entry.base_url.trim_end_matches('/').to_string(),
            api_key: entry.api_key.clone(),
            model: entry.model.clone(),
            priority: entry.priority,
            healthy: true,
            last_probe: None,
            fail_count: 0,
            requests_ok: 0,
            requests_err: 0,
        })
    }
}

/// Read-only view of one endpoint for status displays.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointSnapshot {
    pub name: String,
    pub model: String,
    pub priority: u32,
    pub healthy: bool,
    pub current: bool,
    pub pinned: bool,
    pub requests_ok: u64,
    pub requests_err: u64,
}
