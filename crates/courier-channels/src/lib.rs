//! Channel layer: the normalized message envelope shared by every IM
//! platform and the `ChannelAdapter` contract the gateway drives.
//!
//! Concrete platform adapters (Telegram, Feishu, WeWork, DingTalk, QQ)
//! live outside this workspace; they implement [`adapter::ChannelAdapter`]
//! and forward inbound traffic through the registered [`adapter::InboundSender`].

pub mod adapter;
pub mod error;
pub mod transcribe;
pub mod types;

pub use adapter::{ChannelAdapter, ChannelEvent, Inbound, InboundSender};
pub use error::ChannelError;
pub use transcribe::Transcriber;
pub use types::{
    ChatType, MediaFile, MediaStatus, MessageContent, MessageType, OutgoingMessage, ParseMode,
    UnifiedMessage,
};
