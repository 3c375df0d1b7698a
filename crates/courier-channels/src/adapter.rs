use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ChannelError, Result};
use crate::types::{MediaFile, OutgoingMessage, UnifiedMessage};

/// A platform event outside the message flow (member joined, chat renamed, …).
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub channel: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// What an adapter forwards into the gateway.
#[derive(Debug)]
pub enum Inbound {
    Message(UnifiedMessage),
    Event(ChannelEvent),
}

/// Handed to each adapter at registration; adapters push inbound traffic
/// through it. Sends never block — the gateway drains on its own worker.
pub type InboundSender = mpsc::UnboundedSender<Inbound>;

/// Common interface implemented by every channel adapter (Telegram, Feishu,
/// WeWork, DingTalk, QQ, …).
///
/// Implementations must be `Send + Sync` so the gateway can hold them in a
/// registry and drive them from multiple Tokio tasks. Optional capabilities
/// default to [`ChannelError::NotSupported`]; the gateway catches that and
/// either degrades or reports the limitation to the agent as a tool result.
///
/// Adapters that can only reply once per inbound message (response-url
/// platforms) must still accept repeated `send_message` calls and multiplex
/// internally — typically through a stream buffer (see `courier-stream`).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable lowercase identifier, unique across registered adapters.
    fn name(&self) -> &str;

    /// Establish the connection / start webhooks. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Gracefully close the connection. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Register the gateway's inbound sink. Called once before `start`.
    fn register_inbound(&self, tx: InboundSender);

    /// Deliver one outbound message, returning the platform's message id.
    ///
    /// Degraded paths return `"stream:<id>"`, `"response_url_sent"` or `""`.
    async fn send_message(&self, message: &OutgoingMessage) -> Result<String>;

    /// Convenience wrapper around [`ChannelAdapter::send_message`].
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String> {
        self.send_message(&OutgoingMessage::text(chat_id, text)).await
    }

    async fn send_image(
        &self,
        chat_id: &str,
        image_path: &Path,
        caption: Option<&str>,
    ) -> Result<String> {
        self.send_message(&OutgoingMessage::with_image(
            chat_id,
            image_path,
            caption.map(String::from),
        ))
        .await
    }

    async fn send_file(
        &self,
        chat_id: &str,
        file_path: &Path,
        caption: Option<&str>,
    ) -> Result<String> {
        self.send_message(&OutgoingMessage::with_file(
            chat_id,
            file_path,
            caption.map(String::from),
        ))
        .await
    }

    async fn send_voice(
        &self,
        chat_id: &str,
        voice_path: &Path,
        caption: Option<&str>,
    ) -> Result<String> {
        self.send_message(&OutgoingMessage::with_voice(
            chat_id,
            voice_path,
            caption.map(String::from),
        ))
        .await
    }

    /// Show a typing indicator. Default no-op for platforms without one.
    async fn send_typing(&self, _chat_id: &str) -> Result<()> {
        Ok(())
    }

    /// Fetch a media file to the local cache, returning the path.
    async fn download_media(&self, _media: &MediaFile) -> Result<PathBuf> {
        Err(ChannelError::not_supported(self.name(), "download_media"))
    }

    /// Upload a local file to the platform, returning its media handle.
    async fn upload_media(&self, _path: &Path, _mime_type: &str) -> Result<MediaFile> {
        Err(ChannelError::not_supported(self.name(), "upload_media"))
    }
}
