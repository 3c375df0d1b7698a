use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use base64::Engine;
use md5::{Digest, Md5};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StreamError};
use crate::types::{
    RefreshReply, StreamImage, StreamSession, StreamSettings, MAX_IMAGES_PER_REPLY,
    MAX_IMAGE_BYTES,
};

/// Owner of all live stream sessions.
///
/// Sessions live in one map keyed by stream id; the (chat_id, user_id) →
/// stream id map is a secondary index. Deletion updates both, and orphaned
/// index entries are tolerated — the stream-id path is authoritative.
pub struct StreamRegistry {
    state: Mutex<RegistryState>,
    settings: StreamSettings,
}

struct RegistryState {
    sessions: HashMap<String, StreamSession>,
    by_chat_user: HashMap<(String, String), String>,
    /// reply_to message id → one-shot response URL, consumed on use.
    response_urls: HashMap<String, String>,
}

impl StreamRegistry {
    pub fn new(settings: StreamSettings) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                by_chat_user: HashMap::new(),
                response_urls: HashMap::new(),
            }),
            settings,
        })
    }

    /// Spawn the background sweeper. Sessions older than timeout + grace
    /// are dropped even if the platform never polls again.
    pub fn start_sweeper(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.settings.sweep_interval);
            loop {
                tick.tick().await;
                registry.sweep();
            }
        });
    }

    /// Open a stream for an inbound message. Any existing session for the
    /// same (chat, user) is replaced — the uniqueness invariant.
    /// Returns the generated stream id; the caller's immediate platform
    /// reply is `{id, finish: false, content: ""}`.
    pub fn open(
        &self,
        chat_id: &str,
        user_id: &str,
        msg_id: &str,
        response_url: Option<String>,
    ) -> String {
        let stream_id = format!("stream_{}", Uuid::new_v4().simple());
        let mut state = self.state.lock().unwrap();

        let key = (chat_id.to_string(), user_id.to_string());
        if let Some(old_id) = state.by_chat_user.insert(key, stream_id.clone()) {
            if state.sessions.remove(&old_id).is_some() {
                warn!(stream = %old_id, "replacing existing stream session for chat/user");
            }
        }

        if let Some(url) = &response_url {
            state.response_urls.insert(msg_id.to_string(), url.clone());
        }

        state.sessions.insert(
            stream_id.clone(),
            StreamSession::new(
                stream_id.clone(),
                chat_id.to_string(),
                user_id.to_string(),
                msg_id.to_string(),
                response_url,
            ),
        );

        info!(stream = %stream_id, chat = %chat_id, "stream session opened");
        stream_id
    }

    /// Answer one refresh callback from the platform.
    pub fn refresh(&self, stream_id: &str) -> RefreshReply {
        let mut state = self.state.lock().unwrap();

        let Some(session) = state.sessions.get_mut(stream_id) else {
            debug!(stream = %stream_id, "refresh for unknown stream — tombstone");
            return RefreshReply::tombstone();
        };

        let now = Instant::now();

        // Hard timeout: force-finish with a notice, regardless of state.
        if now.duration_since(session.created_at) >= self.settings.timeout && !session.finished {
            warn!(stream = %stream_id, "stream timed out");
            let mut content = session.content.clone();
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("(reply timed out)");
            state.remove(stream_id);
            return RefreshReply::finished(content, Vec::new());
        }

        if !session.finished {
            return RefreshReply::ongoing(session.content.clone());
        }

        // Finished, but only finalize once the settle delay has elapsed
        // since the last write — a trailing image may still be coming.
        if now.duration_since(session.updated_at) < self.settings.settle_delay {
            return RefreshReply::ongoing(session.content.clone());
        }

        let content = session.content.clone();
        let images: Vec<StreamImage> = session
            .images
            .iter()
            .take(MAX_IMAGES_PER_REPLY)
            .cloned()
            .collect();
        state.remove(stream_id);
        info!(stream = %stream_id, images = images.len(), "stream finalized");
        RefreshReply::finished(content, images)
    }

    /// Agent text write. Looks up by reply_to id first, then by
    /// (chat, user). Sets the content, marks finished, bumps the settle
    /// clock. Returns false when no session matches — the caller falls
    /// back to the one-shot response URL.
    pub fn write_text(
        &self,
        reply_to: Option<&str>,
        chat_id: &str,
        user_id: &str,
        text: &str,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(id) = state.resolve(reply_to, chat_id, user_id) else {
            return false;
        };
        let Some(session) = state.sessions.get_mut(&id) else {
            return false;
        };
        session.content = text.to_string();
        session.finished = true;
        session.updated_at = Instant::now();
        debug!(stream = %id, len = text.len(), "stream content updated");
        true
    }

    /// Queue an image for the finalizing reply and reset the settle clock.
    /// JPEG/PNG only; callers convert other formats before enqueueing.
    pub fn enqueue_image(
        &self,
        reply_to: Option<&str>,
        chat_id: &str,
        user_id: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<()> {
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(StreamError::ImageTooLarge {
                size: bytes.len(),
                max: MAX_IMAGE_BYTES,
            });
        }
        if mime_type != "image/jpeg" && mime_type != "image/png" {
            return Err(StreamError::UnsupportedImageType(mime_type.to_string()));
        }

        let mut state = self.state.lock().unwrap();
        let id = state
            .resolve(reply_to, chat_id, user_id)
            .ok_or_else(|| StreamError::NoSession(format!("{chat_id}/{user_id}")))?;
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| StreamError::NoSession(id.clone()))?;

        let base64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        let md5 = hex::encode(Md5::digest(bytes));
        session.images.push(StreamImage { base64, md5 });
        session.updated_at = Instant::now();
        debug!(stream = %id, queued = session.images.len(), "image queued for stream");
        Ok(())
    }

    /// Take the one-shot response URL for a message, consuming it.
    pub fn take_response_url(&self, msg_id: &str) -> Option<String> {
        self.state.lock().unwrap().response_urls.remove(msg_id)
    }

    /// Whether any session exists for this (chat, user).
    pub fn has_session(&self, chat_id: &str, user_id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .by_chat_user
            .get(&(chat_id.to_string(), user_id.to_string()))
            .is_some_and(|id| state.sessions.contains_key(id))
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// Drop sessions whose creation is older than timeout + grace.
    pub fn sweep(&self) {
        let cutoff = self.settings.timeout + self.settings.sweep_grace;
        let mut state = self.state.lock().unwrap();
        let stale: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.created_at.elapsed() >= cutoff)
            .map(|s| s.id.clone())
            .collect();
        for id in stale {
            warn!(stream = %id, "sweeping stale stream session");
            state.remove(&id);
        }
    }
}

impl RegistryState {
    /// reply_to mapping takes precedence over the chat-keyed lookup.
    fn resolve(&self, reply_to: Option<&str>, chat_id: &str, user_id: &str) -> Option<String> {
        if let Some(msg_id) = reply_to {
            if let Some(session) = self.sessions.values().find(|s| s.msg_id == msg_id) {
                return Some(session.id.clone());
            }
        }
        self.by_chat_user
            .get(&(chat_id.to_string(), user_id.to_string()))
            .filter(|id| self.sessions.contains_key(*id))
            .cloned()
    }

    fn remove(&mut self, stream_id: &str) {
        if let Some(session) = self.sessions.remove(stream_id) {
            let key = (session.chat_id, session.user_id);
            if self
                .by_chat_user
                .get(&key)
                .is_some_and(|id| id == stream_id)
            {
                self.by_chat_user.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_settings() -> StreamSettings {
        StreamSettings {
            settle_delay: Duration::from_millis(80),
            timeout: Duration::from_millis(500),
            sweep_grace: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(100),
        }
    }

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0, 1, 2, 3];

    #[tokio::test]
    async fn refresh_before_and_after_settle() {
        // Compressed S4: text write, late image, then refreshes around the
        // settle boundary.
        let registry = StreamRegistry::new(fast_settings());
        let sid = registry.open("chat", "user", "m1", None);

        assert!(registry.write_text(None, "chat", "user", "hi"));
        // settle not elapsed — live text, no finish
        assert_eq!(registry.refresh(&sid), RefreshReply::ongoing("hi"));

        // a late image resets the settle clock
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry
            .enqueue_image(None, "chat", "user", "image/png", PNG)
            .expect("enqueue");
        tokio::time::sleep(Duration::from_millis(50)).await;
        // 50ms since the image write < 80ms settle — still not final
        assert!(!registry.refresh(&sid).finish);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let final_reply = registry.refresh(&sid);
        assert!(final_reply.finish);
        assert_eq!(final_reply.content, "hi");
        assert_eq!(final_reply.images.len(), 1);

        // session deleted on finalize
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.refresh(&sid), RefreshReply::tombstone());
    }

    #[tokio::test]
    async fn no_finish_reply_before_settle_elapses() {
        let registry = StreamRegistry::new(fast_settings());
        let sid = registry.open("chat", "user", "m1", None);
        registry.write_text(None, "chat", "user", "text");

        // hammer refreshes during the settle window — none may finalize
        for _ in 0..5 {
            assert!(!registry.refresh(&sid).finish);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn unknown_stream_gets_tombstone() {
        let registry = StreamRegistry::new(fast_settings());
        assert_eq!(registry.refresh("stream_missing"), RefreshReply::tombstone());
    }

    #[test]
    fn one_session_per_chat_user() {
        let registry = StreamRegistry::new(fast_settings());
        let first = registry.open("chat", "user", "m1", None);
        let second = registry.open("chat", "user", "m2", None);

        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.refresh(&first), RefreshReply::tombstone());
        assert!(!registry.refresh(&second).finish);
    }

    #[tokio::test]
    async fn timeout_force_finishes_with_notice() {
        let registry = StreamRegistry::new(StreamSettings {
            timeout: Duration::from_millis(40),
            ..fast_settings()
        });
        let sid = registry.open("chat", "user", "m1", None);
        registry.write_text(None, "chat", "user", "partial");
        // un-finish so the timeout path is exercised
        {
            let mut state = registry.state.lock().unwrap();
            state.sessions.get_mut(&sid).unwrap().finished = false;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let reply = registry.refresh(&sid);
        assert!(reply.finish);
        assert!(reply.content.contains("timed out"));
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn reply_to_lookup_takes_precedence() {
        let registry = StreamRegistry::new(fast_settings());
        let _sid_a = registry.open("chat-a", "user", "m-a", None);
        let _sid_b = registry.open("chat-b", "user", "m-b", None);

        // write addressed by reply_to lands on the right session even with
        // a mismatched chat hint
        assert!(registry.write_text(Some("m-a"), "chat-b", "user", "for a"));
        let state = registry.state.lock().unwrap();
        let a = state.sessions.values().find(|s| s.msg_id == "m-a").unwrap();
        assert_eq!(a.content, "for a");
    }

    #[test]
    fn write_without_session_falls_back() {
        let registry = StreamRegistry::new(fast_settings());
        assert!(!registry.write_text(None, "chat", "user", "hello"));
    }

    #[test]
    fn response_url_is_one_shot() {
        let registry = StreamRegistry::new(fast_settings());
        registry.open("chat", "user", "m1", Some("https://cb.example/once".into()));
        assert_eq!(
            registry.take_response_url("m1").as_deref(),
            Some("https://cb.example/once")
        );
        assert_eq!(registry.take_response_url("m1"), None);
    }

    #[test]
    fn image_constraints_enforced() {
        let registry = StreamRegistry::new(fast_settings());
        registry.open("chat", "user", "m1", None);

        let err = registry
            .enqueue_image(None, "chat", "user", "image/gif", PNG)
            .unwrap_err();
        assert!(matches!(err, StreamError::UnsupportedImageType(_)));

        let huge = vec![0u8; MAX_IMAGE_BYTES + 1];
        let err = registry
            .enqueue_image(None, "chat", "user", "image/png", &huge)
            .unwrap_err();
        assert!(matches!(err, StreamError::ImageTooLarge { .. }));
    }

    #[test]
    fn image_md5_is_hex_digest() {
        let registry = StreamRegistry::new(fast_settings());
        let sid = registry.open("chat", "user", "m1", None);
        registry
            .enqueue_image(None, "chat", "user", "image/jpeg", b"abc")
            .expect("enqueue");
        let state = registry.state.lock().unwrap();
        let session = state.sessions.get(&sid).unwrap();
        assert_eq!(session.images[0].md5, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn sweep_drops_stale_sessions() {
        let registry = StreamRegistry::new(StreamSettings {
            timeout: Duration::from_millis(30),
            sweep_grace: Duration::from_millis(10),
            ..fast_settings()
        });
        registry.open("chat", "user", "m1", None);
        assert_eq!(registry.session_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.sweep();
        assert_eq!(registry.session_count(), 0);
    }
}
