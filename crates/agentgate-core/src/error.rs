//! Error types for `agentgate` core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `agentgate` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Worker frame could not be decoded
    #[error("Failed to parse worker frame: {0}")]
    FrameParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
