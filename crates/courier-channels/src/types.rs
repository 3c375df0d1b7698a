use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Derived tag of a message, computed from its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Voice,
    File,
    Video,
    Location,
    Sticker,
    /// Text plus at least one media item.
    Mixed,
    /// Text starting with `/`.
    Command,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    Pending,
    Downloading,
    Ready,
    Failed,
    /// Post-processing (transcription, description, extraction) done.
    Processed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Private,
    Group,
    Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    Markdown,
    Html,
    None,
}

/// A media attachment: image, voice, video or document.
///
/// Ownership moves with the enclosing content; the adapter that downloads
/// it fills in `local_path` and flips `status` to `Ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaFile {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,

    /// Platform-provided download URL, when the channel serves one.
    pub url: Option<String>,
    /// Channel-native file handle (Telegram file_id, Feishu media key, …).
    pub file_id: Option<String>,

    pub local_path: Option<PathBuf>,
    pub status: MediaStatus,

    /// Speech-to-text result for voices.
    pub transcription: Option<String>,
    /// Vision description for images.
    pub description: Option<String>,
    /// Extracted body text for documents.
    pub extracted_text: Option<String>,

    /// Duration in seconds for audio/video.
    pub duration: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,

    /// Set for channels whose media URLs serve AES ciphertext that must be
    /// decrypted after download.
    #[serde(default)]
    pub aes_encrypted: bool,
}

impl MediaFile {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            id: format!("media_{}", short_hex()),
            filename: filename.into(),
            mime_type: mime_type.into(),
            size: 0,
            url: None,
            file_id: None,
            local_path: None,
            status: MediaStatus::Pending,
            transcription: None,
            description: None,
            extracted_text: None,
            duration: None,
            width: None,
            height: None,
            aes_encrypted: false,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    /// Build a media file from an already-local path. The only way to
    /// construct a `Ready` media — keeps the `Ready ⇒ local_path` invariant.
    pub fn from_local(path: impl AsRef<Path>, mime_type: impl Into<String>) -> Self {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mut media = Self::new(filename, mime_type);
        media.local_path = Some(path.to_path_buf());
        media.status = MediaStatus::Ready;
        media
    }

    /// Record a completed download. Always sets both fields together.
    pub fn mark_ready(&mut self, path: PathBuf) {
        self.local_path = Some(path);
        self.status = MediaStatus::Ready;
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    pub fn is_ready(&self) -> bool {
        self.status == MediaStatus::Ready && self.local_path.is_some()
    }
}

/// Geographic point attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sticker {
    pub id: String,
    pub emoji: Option<String>,
    pub set_name: Option<String>,
}

/// Text plus parallel ordered media sequences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: Option<String>,
    #[serde(default)]
    pub images: Vec<MediaFile>,
    #[serde(default)]
    pub voices: Vec<MediaFile>,
    #[serde(default)]
    pub videos: Vec<MediaFile>,
    #[serde(default)]
    pub files: Vec<MediaFile>,
    pub location: Option<Location>,
    pub sticker: Option<Sticker>,
}

impl MessageContent {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_image(image: MediaFile, caption: Option<String>) -> Self {
        Self {
            text: caption,
            images: vec![image],
            ..Default::default()
        }
    }

    pub fn with_voice(voice: MediaFile, caption: Option<String>) -> Self {
        Self {
            text: caption,
            voices: vec![voice],
            ..Default::default()
        }
    }

    pub fn with_file(file: MediaFile, caption: Option<String>) -> Self {
        Self {
            text: caption,
            files: vec![file],
            ..Default::default()
        }
    }

    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn has_media(&self) -> bool {
        !self.images.is_empty()
            || !self.voices.is_empty()
            || !self.videos.is_empty()
            || !self.files.is_empty()
    }

    pub fn all_media(&self) -> impl Iterator<Item = &MediaFile> {
        self.images
            .iter()
            .chain(&self.voices)
            .chain(&self.videos)
            .chain(&self.files)
    }

    pub fn all_media_mut(&mut self) -> impl Iterator<Item = &mut MediaFile> {
        self.images
            .iter_mut()
            .chain(&mut self.voices)
            .chain(&mut self.videos)
            .chain(&mut self.files)
    }

    /// Derive the message tag from the first non-empty category.
    pub fn message_type(&self) -> MessageType {
        if self.has_text() && self.has_media() {
            return MessageType::Mixed;
        }
        if !self.images.is_empty() {
            return MessageType::Image;
        }
        if !self.voices.is_empty() {
            return MessageType::Voice;
        }
        if !self.videos.is_empty() {
            return MessageType::Video;
        }
        if !self.files.is_empty() {
            return MessageType::File;
        }
        if self.location.is_some() {
            return MessageType::Location;
        }
        if self.sticker.is_some() {
            return MessageType::Sticker;
        }
        match self.text.as_deref() {
            Some(t) if t.starts_with('/') => MessageType::Command,
            Some(t) if !t.is_empty() => MessageType::Text,
            _ => MessageType::Unknown,
        }
    }

    /// Project the content to the plain text handed to the reasoning model.
    ///
    /// Media collapse to bracketed descriptions. Items that failed
    /// processing still render a presence marker (`[voice: N seconds]`,
    /// `[image: name]`) rather than disappearing, so the model can reason
    /// about them. A voice whose transcription was already merged into
    /// `text` (status `Processed`, no transcription) renders nothing.
    pub fn plain_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        if let Some(text) = self.text.as_deref() {
            if !text.is_empty() {
                parts.push(text.to_string());
            }
        }

        for img in &self.images {
            match img.description.as_deref() {
                Some(d) if !d.is_empty() => parts.push(format!("[image: {d}]")),
                _ => parts.push(format!("[image: {}]", img.filename)),
            }
        }

        for voice in &self.voices {
            match voice.transcription.as_deref() {
                Some(t) if !t.is_empty() => parts.push(format!("[voice transcription: {t}]")),
                _ if voice.status == MediaStatus::Processed => {}
                _ => parts.push(format!("[voice: {} seconds]", duration_label(voice.duration))),
            }
        }

        for video in &self.videos {
            parts.push(format!(
                "[video: {}, {} seconds]",
                video.filename,
                duration_label(video.duration)
            ));
        }

        for file in &self.files {
            match file.extracted_text.as_deref() {
                Some(t) if !t.is_empty() => parts.push(format!("[file content: {t}]")),
                _ => parts.push(format!("[file: {}]", file.filename)),
            }
        }

        if let Some(loc) = &self.location {
            parts.push(format!(
                "[location: {}]",
                loc.name.as_deref().unwrap_or("unknown")
            ));
        }

        if let Some(sticker) = &self.sticker {
            parts.push(format!(
                "[sticker: {}]",
                sticker.emoji.as_deref().unwrap_or("?")
            ));
        }

        parts.join("\n")
    }
}

fn duration_label(duration: Option<f64>) -> String {
    match duration {
        Some(d) => format!("{d:.0}"),
        None => "unknown".to_string(),
    }
}

/// Normalized inbound envelope produced by every channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub id: String,
    /// Lowercase channel tag (e.g. "telegram", "feishu", "wework_bot").
    pub channel: String,
    pub channel_message_id: String,

    /// Stable user id, prefixed with the channel code to avoid cross-channel
    /// collisions (e.g. "tg_12345").
    pub user_id: String,
    pub channel_user_id: String,

    pub chat_id: String,
    pub chat_type: ChatType,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,

    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,

    /// Raw platform payload, retained verbatim for adapter-specific replies.
    #[serde(default)]
    pub raw: serde_json::Value,
    /// Free-form adapter metadata. Must carry the channel-native user id
    /// when the platform needs it for egress routing.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl UnifiedMessage {
    pub fn new(
        channel: impl Into<String>,
        channel_message_id: impl Into<String>,
        channel_user_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: MessageContent,
    ) -> Self {
        let channel = channel.into();
        let channel_user_id = channel_user_id.into();
        let user_id = format!("{}_{}", channel_code(&channel), channel_user_id);
        Self {
            id: format!("msg_{}", short_hex()),
            channel,
            channel_message_id: channel_message_id.into(),
            user_id,
            channel_user_id,
            chat_id: chat_id.into(),
            chat_type: ChatType::Private,
            thread_id: None,
            reply_to: None,
            content,
            timestamp: Utc::now(),
            raw: serde_json::Value::Null,
            metadata: HashMap::new(),
        }
    }

    pub fn text(&self) -> &str {
        self.content.text.as_deref().unwrap_or("")
    }

    pub fn plain_text(&self) -> String {
        self.content.plain_text()
    }

    pub fn message_type(&self) -> MessageType {
        self.content.message_type()
    }

    pub fn is_command(&self) -> bool {
        self.message_type() == MessageType::Command
    }

    /// Command name without the leading `/`, for command-type messages.
    pub fn command(&self) -> Option<&str> {
        if !self.is_command() {
            return None;
        }
        self.text()[1..].split_whitespace().next()
    }

    pub fn command_args(&self) -> &str {
        if !self.is_command() {
            return "";
        }
        match self.text()[1..].split_once(char::is_whitespace) {
            Some((_, rest)) => rest.trim_start(),
            None => "",
        }
    }
}

/// Short channel code used as the user-id prefix.
fn channel_code(channel: &str) -> &str {
    match channel {
        "telegram" => "tg",
        "feishu" => "fs",
        "wework" => "ww",
        "wework_bot" => "wwb",
        "dingtalk" => "dt",
        "qq" => "qq",
        "qq_official" => "qqo",
        other => other,
    }
}

/// Outbound message constructed by the agent, consumed by adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub chat_id: String,
    pub content: MessageContent,

    pub reply_to: Option<String>,
    pub thread_id: Option<String>,

    pub parse_mode: ParseMode,
    #[serde(default)]
    pub disable_preview: bool,
    #[serde(default)]
    pub silent: bool,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutgoingMessage {
    pub fn text(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            content: MessageContent::text_only(text),
            reply_to: None,
            thread_id: None,
            parse_mode: ParseMode::Markdown,
            disable_preview: false,
            silent: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_image(
        chat_id: impl Into<String>,
        image_path: impl AsRef<Path>,
        caption: Option<String>,
    ) -> Self {
        let path = image_path.as_ref();
        let mime = mime_from_extension(path, "image/png");
        Self {
            content: MessageContent::with_image(MediaFile::from_local(path, mime), caption),
            ..Self::text(chat_id, "")
        }
    }

    pub fn with_file(
        chat_id: impl Into<String>,
        file_path: impl AsRef<Path>,
        caption: Option<String>,
    ) -> Self {
        let path = file_path.as_ref();
        let mime = mime_from_extension(path, "application/octet-stream");
        Self {
            content: MessageContent::with_file(MediaFile::from_local(path, mime), caption),
            ..Self::text(chat_id, "")
        }
    }

    pub fn with_voice(
        chat_id: impl Into<String>,
        voice_path: impl AsRef<Path>,
        caption: Option<String>,
    ) -> Self {
        let path = voice_path.as_ref();
        let mime = mime_from_extension(path, "audio/ogg");
        Self {
            content: MessageContent::with_voice(MediaFile::from_local(path, mime), caption),
            ..Self::text(chat_id, "")
        }
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

fn mime_from_extension(path: &Path, fallback: &str) -> String {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ogg" | "oga" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        _ => fallback,
    }
    .to_string()
}

fn short_hex() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}
