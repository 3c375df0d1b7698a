use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// Speech-to-text backend used during media preprocessing.
///
/// Implementations typically offload to a worker pool (local Whisper) or a
/// cloud API; either way the call is awaitable and must not monopolise the
/// scheduler. A failed transcription surfaces as `Err` — the gateway turns
/// that into the `[voice recognition failed]` marker so the signal is
/// preserved for the model.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> Result<String>;
}
