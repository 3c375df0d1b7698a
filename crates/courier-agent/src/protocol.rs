//! Native request/response shapes consumed by the turn loop and produced
//! by the wire clients. The model mirrors the messages dialect: a message
//! is a role plus either a plain string or a list of typed content blocks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// Base64 image payload in the native block format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }
}

/// Message body: a plain string or structured content blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageBody,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageBody::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessageBody::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageBody::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessageBody::Blocks(blocks),
        }
    }
}

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One tool invocation extracted from a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// The single request primitive exposed by the endpoint pool.
#[derive(Debug, Clone, Default)]
pub struct MessagesRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    /// Provider-specific flags merged into the request body verbatim on
    /// top of the endpoint's own extras (e.g. `enable_thinking`).
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl MessagesRequest {
    /// Cheap health-probe request: one short user message, tiny budget.
    pub fn probe() -> Self {
        Self {
            system: None,
            messages: vec![ChatMessage::user("hi")],
            tools: Vec::new(),
            max_tokens: 10,
            extras: serde_json::Map::new(),
        }
    }
}

/// Canonical stop reasons. Provider-specific strings are folded into this
/// closed set by the wire clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    Other,
}

impl StopReason {
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "end_turn" | "stop" | "stop_sequence" | "max_tokens" | "length" => Self::EndTurn,
            "tool_use" | "tool_calls" => Self::ToolUse,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Normalized response: always the native block shape, whatever dialect the
/// serving endpoint spoke.
#[derive(Debug, Clone)]
pub struct MessagesResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub model: String,
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    /// Tool invocations in response order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_folds_provider_strings() {
        assert_eq!(StopReason::from_provider("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::from_provider("stop"), StopReason::EndTurn);
        assert_eq!(StopReason::from_provider("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::from_provider("tool_calls"), StopReason::ToolUse);
        assert_eq!(StopReason::from_provider("weird"), StopReason::Other);
    }

    #[test]
    fn response_text_concatenates_blocks() {
        let resp = MessagesResponse {
            content: vec![
                ContentBlock::text("a"),
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "run_shell".into(),
                    input: serde_json::json!({"command": "ls"}),
                },
                ContentBlock::text("b"),
            ],
            stop_reason: StopReason::ToolUse,
            model: "m".into(),
            usage: Usage::default(),
        };
        assert_eq!(resp.text(), "ab");
        let calls = resp.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "run_shell");
    }

    #[test]
    fn content_block_serde_shape() {
        let block = ContentBlock::tool_result("t1", "ok");
        let json = serde_json::to_value(&block).expect("serialize");
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool_use_id"], "t1");

        let body = MessageBody::Text("plain".into());
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json, serde_json::json!("plain"));
    }
}
