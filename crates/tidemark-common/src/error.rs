//! Error types shared across Tidemark crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, TidemarkError>;

#[derive(Error, Debug)]
pub enum TidemarkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid bookmark: {0}")]
    InvalidBookmark(String),
}

impl TidemarkError {
    pub fn invalid_bookmark(message: impl Into<String>) -> Self {
        Self::InvalidBookmark(message.into())
    }
}
