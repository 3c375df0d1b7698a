//! Inbound media preprocessing: download to the local cache, transcribe
//! voices, and collect base64 image blocks for multimodal endpoints.
//!
//! Downloads run concurrently under a global semaphore so a burst of media
//! messages cannot saturate the adapters.

use std::sync::Arc;

use base64::Engine;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use courier_channels::{ChannelAdapter, MediaStatus, Transcriber, UnifiedMessage};

/// Marker preserved for the model when speech-to-text fails — the signal
/// that a voice arrived still matters.
pub const VOICE_FAILED_MARKER: &str = "[voice recognition failed]";

/// Base64 image payload ready to become a protocol image block.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub media_type: String,
    pub data: String,
}

/// Download and post-process every media item of an inbound message.
///
/// Voices: the transcription replaces the message text when it was empty
/// (or the auto voice placeholder); otherwise it is appended as
/// `[voice content: …]`. Images: read back as base64 for the session's
/// `pending_images`. Failures mark the media `Failed` and move on — the
/// plain-text projection still renders a presence marker.
pub async fn preprocess_media(
    adapter: &Arc<dyn ChannelAdapter>,
    transcriber: Option<&Arc<dyn Transcriber>>,
    semaphore: &Arc<Semaphore>,
    message: &mut UnifiedMessage,
) -> Vec<PendingImage> {
    // Download phase — media without a local copy, bounded concurrency.
    let downloads: Vec<(usize, courier_channels::MediaFile)> = message
        .content
        .all_media()
        .enumerate()
        .filter(|(_, media)| media.local_path.is_none())
        .map(|(i, media)| (i, media.clone()))
        .collect();

    let mut results = Vec::with_capacity(downloads.len());
    for (index, media) in downloads {
        let adapter = Arc::clone(adapter);
        let permit = Arc::clone(semaphore).acquire_owned().await;
        results.push(tokio::spawn(async move {
            let _permit = permit;
            let outcome = adapter.download_media(&media).await;
            (index, outcome)
        }));
    }

    for handle in results {
        let Ok((index, outcome)) = handle.await else {
            continue;
        };
        let Some(media) = message.content.all_media_mut().nth(index) else {
            continue;
        };
        match outcome {
            Ok(path) => {
                debug!(media = %media.id, path = %path.display(), "media downloaded");
                media.mark_ready(path);
            }
            Err(e) => {
                warn!(media = %media.id, err = %e, "media download failed");
                media.status = MediaStatus::Failed;
            }
        }
    }

    transcribe_voices(transcriber, message).await;
    collect_pending_images(message)
}

async fn transcribe_voices(
    transcriber: Option<&Arc<dyn Transcriber>>,
    message: &mut UnifiedMessage,
) {
    if message.content.voices.is_empty() {
        return;
    }

    let mut transcripts: Vec<(usize, String)> = Vec::new();
    for (i, voice) in message.content.voices.iter().enumerate() {
        let Some(path) = voice.local_path.as_deref() else {
            continue;
        };
        let text = match transcriber {
            Some(t) => match t.transcribe(path).await {
                Ok(text) if !text.is_empty() => text,
                Ok(_) => VOICE_FAILED_MARKER.to_string(),
                Err(e) => {
                    warn!(media = %voice.id, err = %e, "transcription failed");
                    VOICE_FAILED_MARKER.to_string()
                }
            },
            None => VOICE_FAILED_MARKER.to_string(),
        };
        transcripts.push((i, text));
    }

    for (i, text) in transcripts {
        apply_transcription(message, i, text);
    }
}

/// Merge one transcription into the message per the replacement rule:
/// empty or auto-placeholder text is replaced outright, real user text
/// gets the transcription appended.
fn apply_transcription(message: &mut UnifiedMessage, voice_index: usize, text: String) {
    let current = message.content.text.as_deref().unwrap_or("");
    let is_placeholder = current.is_empty() || current.starts_with("[voice:");

    let voice = &mut message.content.voices[voice_index];
    if is_placeholder {
        message.content.text = Some(text);
        // absorbed into the text — the projection must not repeat it
        voice.transcription = None;
    } else {
        message.content.text = Some(format!("{current}\n[voice content: {text}]"));
        voice.transcription = None;
    }
    voice.status = MediaStatus::Processed;
}

/// Read ready images back as base64 for the multimodal path.
fn collect_pending_images(message: &UnifiedMessage) -> Vec<PendingImage> {
    let mut pending = Vec::new();
    for image in &message.content.images {
        let Some(path) = image.local_path.as_deref() else {
            continue;
        };
        match std::fs::read(path) {
            Ok(bytes) => pending.push(PendingImage {
                media_type: image.mime_type.clone(),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
            Err(e) => warn!(media = %image.id, err = %e, "failed to read image for encoding"),
        }
    }
    pending
}
