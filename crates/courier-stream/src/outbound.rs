//! Outbound glue for stream-capable adapters: `send_message` on such a
//! channel never calls the platform directly — it writes into the stream
//! buffer and lets refresh callbacks pick the content up.

use tracing::warn;

use courier_channels::OutgoingMessage;

use crate::error::StreamError;
use crate::registry::StreamRegistry;

/// Where an outbound message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Buffered into a live stream session.
    Stream { stream_id_hint: String },
    /// No session matched — the adapter should fall back to its one-shot
    /// response URL (or drop the message).
    NoSession,
}

/// Apply one outbound message to the stream buffer for (chat, user).
///
/// Text updates the buffer and marks the stream finished; each ready image
/// is enqueued for the finalizing reply (resetting the settle clock).
/// Non-JPEG/PNG images are skipped with a warning — converting is the
/// adapter's job before calling in.
pub fn apply_outgoing(
    registry: &StreamRegistry,
    user_id: &str,
    message: &OutgoingMessage,
) -> WriteOutcome {
    let reply_to = message.reply_to.as_deref();
    let chat_id = message.chat_id.as_str();
    let mut touched = false;

    if let Some(text) = message.content.text.as_deref() {
        if !text.is_empty() {
            touched |= registry.write_text(reply_to, chat_id, user_id, text);
        }
    }

    for image in &message.content.images {
        let Some(path) = image.local_path.as_deref() else {
            continue;
        };
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "stream image unreadable");
                continue;
            }
        };
        match registry.enqueue_image(reply_to, chat_id, user_id, &image.mime_type, &bytes) {
            Ok(()) => touched = true,
            Err(StreamError::NoSession(_)) => {}
            Err(e) => warn!(err = %e, "stream image rejected"),
        }
    }

    if touched {
        WriteOutcome::Stream {
            stream_id_hint: format!("{chat_id}/{user_id}"),
        }
    } else {
        WriteOutcome::NoSession
    }
}
