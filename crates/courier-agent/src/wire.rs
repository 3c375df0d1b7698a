//! Wire clients for the two supported endpoint dialects.
//!
//! `NativeClient` speaks the messages API directly. `OpenAiCompatClient`
//! translates: the system prompt becomes a leading system message,
//! structured content blocks are lowered to plain text (tool loops run
//! text-only on such endpoints), and the response is normalized back into
//! the native shape with a single text block.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::WireError;
use crate::protocol::{
    ChatRole, ContentBlock, MessageBody, MessagesRequest, MessagesResponse, StopReason, Usage,
};

const NATIVE_API_VERSION: &str = "2023-06-01";

/// One dialect-specific transport. The pool drives these; tests substitute
/// their own implementations.
#[async_trait]
pub trait WireClient: Send + Sync {
    async fn send(
        &self,
        model: &str,
        req: &MessagesRequest,
        timeout: Duration,
    ) -> Result<MessagesResponse, WireError>;
}

// ---------------------------------------------------------------------------
// Native (messages API) client
// ---------------------------------------------------------------------------

pub struct NativeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    extras: serde_json::Map<String, serde_json::Value>,
}

impl NativeClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        extras: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            extras,
        }
    }
}

#[async_trait]
impl WireClient for NativeClient {
    async fn send(
        &self,
        model: &str,
        req: &MessagesRequest,
        timeout: Duration,
    ) -> Result<MessagesResponse, WireError> {
        let body = build_native_body(model, req, &self.extras);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model, "sending native request");

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", NATIVE_API_VERSION)
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest(timeout))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "native API error");
            return Err(WireError::Api {
                status,
                message: text,
            });
        }

        let api_resp: NativeResponse = resp
            .json()
            .await
            .map_err(|e| WireError::Parse(e.to_string()))?;

        Ok(parse_native_response(api_resp))
    }
}

pub(crate) fn build_native_body(
    model: &str,
    req: &MessagesRequest,
    endpoint_extras: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    // The messages API takes no system role inside `messages`; fold any
    // stray system turns into the system field.
    let mut system = req.system.clone().unwrap_or_default();
    let mut messages: Vec<serde_json::Value> = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        if msg.role == ChatRole::System {
            if let MessageBody::Text(text) = &msg.content {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(text);
            }
            continue;
        }
        messages.push(serde_json::json!({
            "role": msg.role,
            "content": msg.content,
        }));
    }

    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": req.max_tokens,
        "messages": messages,
    });

    if !system.is_empty() {
        body["system"] = serde_json::json!(system);
    }
    if !req.tools.is_empty() {
        body["tools"] = serde_json::json!(req.tools);
    }
    if let Some(map) = body.as_object_mut() {
        for (k, v) in endpoint_extras.iter().chain(req.extras.iter()) {
            map.insert(k.clone(), v.clone());
        }
    }

    body
}

fn parse_native_response(resp: NativeResponse) -> MessagesResponse {
    let content = resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            NativeBlock::Text { text } => Some(ContentBlock::Text { text }),
            NativeBlock::ToolUse { id, name, input } => {
                Some(ContentBlock::ToolUse { id, name, input })
            }
            NativeBlock::Other => None,
        })
        .collect();

    MessagesResponse {
        content,
        stop_reason: StopReason::from_provider(resp.stop_reason.as_deref().unwrap_or("")),
        model: resp.model,
        usage: resp
            .usage
            .map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default(),
    }
}

#[derive(Deserialize)]
struct NativeResponse {
    model: String,
    content: Vec<NativeBlock>,
    stop_reason: Option<String>,
    usage: Option<NativeUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct NativeUsage {
    input_tokens: u32,
    output_tokens: u32,
}

// ---------------------------------------------------------------------------
// OpenAI-chat-compatible client
// ---------------------------------------------------------------------------

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    extras: serde_json::Map<String, serde_json::Value>,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        extras: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            extras,
        }
    }
}

#[async_trait]
impl WireClient for OpenAiCompatClient {
    async fn send(
        &self,
        model: &str,
        req: &MessagesRequest,
        timeout: Duration,
    ) -> Result<MessagesResponse, WireError> {
        let body = build_openai_body(model, req, &self.extras);
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model, "sending openai-compat request");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest(timeout))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "openai-compat API error");
            return Err(WireError::Api {
                status,
                message: text,
            });
        }

        let api_resp: OpenAiResponse = resp
            .json()
            .await
            .map_err(|e| WireError::Parse(e.to_string()))?;

        Ok(parse_openai_response(api_resp, model))
    }
}

/// Lower the native request shape into chat-completions format.
///
/// This narrowing is deliberate: tool_use blocks are dropped and
/// tool_result blocks become `(tool <id> result) <body>` lines, so a tool
/// loop served by a compat endpoint operates in text-only mode.
pub(crate) fn build_openai_body(
    model: &str,
    req: &MessagesRequest,
    endpoint_extras: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = req.system.as_deref() {
        if !system.is_empty() {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
    }

    for msg in &req.messages {
        let content = match &msg.content {
            MessageBody::Text(text) => text.clone(),
            MessageBody::Blocks(blocks) => lower_blocks(blocks),
        };
        messages.push(serde_json::json!({ "role": msg.role, "content": content }));
    }

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": req.max_tokens,
    });

    if let Some(map) = body.as_object_mut() {
        for (k, v) in endpoint_extras.iter().chain(req.extras.iter()) {
            map.insert(k.clone(), v.clone());
        }
    }

    body
}

/// Flatten structured blocks to text. Images and tool_use blocks have no
/// chat-completions equivalent here and are dropped.
fn lower_blocks(blocks: &[ContentBlock]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(text.clone()),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => parts.push(format!("(tool {tool_use_id} result) {content}")),
            ContentBlock::ToolUse { .. } | ContentBlock::Image { .. } => {}
        }
    }
    parts.join("\n")
}

fn parse_openai_response(resp: OpenAiResponse, requested_model: &str) -> MessagesResponse {
    let choice = resp.choices.into_iter().next();
    let text = choice
        .as_ref()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    let finish = choice.and_then(|c| c.finish_reason).unwrap_or_default();

    MessagesResponse {
        content: vec![ContentBlock::Text { text }],
        stop_reason: StopReason::from_provider(&finish),
        model: resp.model.unwrap_or_else(|| requested_model.to_string()),
        usage: resp
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default(),
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn classify_reqwest(timeout: Duration) -> impl Fn(reqwest::Error) -> WireError {
    move |e| {
        if e.is_timeout() {
            WireError::Timeout {
                secs: timeout.as_secs(),
            }
        } else {
            WireError::Http(e)
        }
    }
}
