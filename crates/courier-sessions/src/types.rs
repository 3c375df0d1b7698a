use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Structured session key: one conversation of one user on one channel.
///
/// Wire format: `{channel}:{chat_id}:{user_id}`. The `user_id` is the
/// channel-prefixed stable id, so it may itself contain no colons; the
/// `chat_id` may (some platforms use composite ids), which is why parsing
/// splits from both ends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub channel: String,
    pub chat_id: String,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Canonical wire-format string.
    pub fn format(&self) -> String {
        format!("{}:{}:{}", self.channel, self.chat_id, self.user_id)
    }

    /// Parse a wire-format key. The channel is everything before the first
    /// colon, the user id everything after the last; the chat id in between
    /// may contain colons.
    pub fn parse(s: &str) -> Result<Self> {
        let first = s
            .find(':')
            .ok_or_else(|| SessionError::InvalidKey(s.to_string()))?;
        let last = s
            .rfind(':')
            .ok_or_else(|| SessionError::InvalidKey(s.to_string()))?;
        if first == last {
            return Err(SessionError::InvalidKey(s.to_string()));
        }

        let channel = &s[..first];
        let chat_id = &s[first + 1..last];
        let user_id = &s[last + 1..];

        if channel.is_empty() || chat_id.is_empty() || user_id.is_empty() {
            return Err(SessionError::InvalidKey(s.to_string()));
        }

        Ok(Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
        })
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    /// Optional chain-of-thought summary recorded alongside an assistant turn.
    pub summary: Option<String>,
    /// Set when the entry was injected mid-turn by the interrupt queue.
    #[serde(default)]
    pub is_interrupt: bool,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            summary: None,
            is_interrupt: false,
            created_at: Utc::now(),
        }
    }

    pub fn interrupt(mut self) -> Self {
        self.is_interrupt = true;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// In-memory session state. Owned by the [`crate::store::SessionStore`];
/// callers hold it through an `Arc<Mutex<Session>>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub history: Vec<HistoryEntry>,
    /// Free-form scratch space. The gateway uses `pending_images` /
    /// `pending_voices` here plus persistent per-session flags.
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Flipped by every mutation; cleared by the persistence flusher.
    #[serde(skip)]
    pub dirty: bool,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            history: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            last_active_at: now,
            dirty: false,
        }
    }

    /// Append a plain turn and mark the session dirty.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        self.add_entry(HistoryEntry::new(role, content));
    }

    pub fn add_entry(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        self.touch();
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn touch(&mut self) {
        self.last_active_at = Utc::now();
        self.dirty = true;
    }

    /// Last `limit` turns, oldest first.
    pub fn recent_history(&self, limit: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
        self.dirty = true;
    }

    pub fn take_metadata(&mut self, key: &str) -> Option<serde_json::Value> {
        let value = self.metadata.remove(key);
        if value.is_some() {
            self.dirty = true;
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple_key() {
        let key = SessionKey::new("telegram", "chat-7", "tg_42");
        let s = key.format();
        assert_eq!(s, "telegram:chat-7:tg_42");
        let parsed = SessionKey::parse(&s).expect("parse failed");
        assert_eq!(parsed, key);
    }

    #[test]
    fn roundtrip_chat_id_with_colons() {
        let key = SessionKey::new("feishu", "oc:group:2026", "fs_u1");
        let parsed = SessionKey::parse(&key.format()).expect("parse failed");
        assert_eq!(parsed.chat_id, "oc:group:2026");
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(SessionKey::parse("telegram").is_err());
        assert!(SessionKey::parse("telegram:chat").is_err());
        assert!(SessionKey::parse("::").is_err());
    }

    #[test]
    fn mutations_flip_dirty() {
        let mut session = Session::new(SessionKey::new("telegram", "c", "u"));
        assert!(!session.dirty);
        session.add_message(Role::User, "hi");
        assert!(session.dirty);

        session.dirty = false;
        session.set_metadata("pending_images", serde_json::json!([]));
        assert!(session.dirty);
    }

    #[test]
    fn recent_history_returns_tail() {
        let mut session = Session::new(SessionKey::new("telegram", "c", "u"));
        for i in 0..10 {
            session.add_message(Role::User, format!("m{i}"));
        }
        let tail = session.recent_history(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].content, "m7");
        assert_eq!(tail[2].content, "m9");
    }
}
