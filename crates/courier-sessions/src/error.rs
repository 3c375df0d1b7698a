use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session key: {0}")]
    InvalidKey(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
