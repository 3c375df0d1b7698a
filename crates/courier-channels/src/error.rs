use thiserror::Error;

/// Errors that can occur within any channel adapter.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The underlying transport could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A message could not be delivered to the remote endpoint.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The channel rejected the supplied credentials or token.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// A media download or upload failed.
    #[error("Media transfer failed: {0}")]
    MediaFailed(String),

    /// An operation exceeded its allowed time budget.
    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The platform cannot implement this optional capability.
    /// The gateway catches this and degrades or surfaces it to the agent.
    #[error("{channel} does not support {operation}")]
    NotSupported { channel: String, operation: String },

    /// The channel-specific configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ChannelError {
    pub fn not_supported(channel: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotSupported {
            channel: channel.into(),
            operation: operation.into(),
        }
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
