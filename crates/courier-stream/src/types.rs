use std::time::{Duration, Instant};

use courier_core::config::StreamConfig;
use serde::Serialize;

/// Ceiling on one attached image.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
/// Images attached to one finalized reply.
pub const MAX_IMAGES_PER_REPLY: usize = 10;

/// Timing knobs, resolved from [`StreamConfig`]. Tests compress these.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Grace period after finish before a reply may finalize.
    pub settle_delay: Duration,
    /// Hard wall-clock limit on a session.
    pub timeout: Duration,
    /// Extra slack the sweeper grants past the timeout.
    pub sweep_grace: Duration,
    /// Sweeper cadence.
    pub sweep_interval: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            settle_delay: Duration::from_secs(config.settle_delay_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            sweep_grace: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(120),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

/// One image queued for the finalizing reply.
#[derive(Debug, Clone, Serialize)]
pub struct StreamImage {
    pub base64: String,
    pub md5: String,
}

/// Buffered reply state for one refresh stream.
///
/// At most one session exists per (chat_id, user_id); opening a new one
/// replaces the old. The session is owned by the registry; callbacks and
/// agent writes reach it only through the registry's lock.
#[derive(Debug)]
pub(crate) struct StreamSession {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    /// The inbound message this stream answers.
    pub msg_id: String,
    /// One-shot fallback reply URL, consumed if the stream dies early.
    pub response_url: Option<String>,
    pub content: String,
    pub images: Vec<StreamImage>,
    pub finished: bool,
    pub created_at: Instant,
    pub updated_at: Instant,
}

impl StreamSession {
    pub fn new(
        id: String,
        chat_id: String,
        user_id: String,
        msg_id: String,
        response_url: Option<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            chat_id,
            user_id,
            msg_id,
            response_url,
            content: String::new(),
            images: Vec::new(),
            finished: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a refresh callback sends back to the platform.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RefreshReply {
    pub finish: bool,
    pub content: String,
    /// Attached only on the finalizing reply.
    pub images: Vec<StreamImage>,
}

impl RefreshReply {
    pub fn ongoing(content: impl Into<String>) -> Self {
        Self {
            finish: false,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn finished(content: impl Into<String>, images: Vec<StreamImage>) -> Self {
        Self {
            finish: true,
            content: content.into(),
            images,
        }
    }

    /// Tombstone for unknown stream ids.
    pub fn tombstone() -> Self {
        Self::finished("", Vec::new())
    }
}

impl PartialEq for StreamImage {
    fn eq(&self, other: &Self) -> bool {
        self.md5 == other.md5
    }
}
