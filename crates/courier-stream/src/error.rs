use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Image too large: {size} bytes (max {max})")]
    ImageTooLarge { size: usize, max: usize },

    #[error("Unsupported image type: {0} (JPEG and PNG only)")]
    UnsupportedImageType(String),

    #[error("No stream session for {0}")]
    NoSession(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
