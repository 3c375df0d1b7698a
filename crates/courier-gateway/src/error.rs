use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Channel error: {0}")]
    Channel(#[from] courier_channels::ChannelError),

    #[error("Agent error: {0}")]
    Agent(#[from] courier_agent::AgentError),

    #[error("Session error: {0}")]
    Session(#[from] courier_sessions::SessionError),

    #[error("Unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error("Send failed after {attempts} attempts: {last}")]
    SendExhausted { attempts: u32, last: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
