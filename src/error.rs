//! Error types for tether-core

use thiserror::Error;

/// Errors that can occur in the session core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Backend executable is missing or the configured path does not exist
    #[error("agent backend binary not available: {0}")]
    MissingBinary(String),

    /// Configured working directory does not exist
    #[error("working directory does not exist: {0}")]
    MissingWorkspace(String),

    /// Operation requires an active connection
    #[error("connection is not active")]
    NotConnected,

    /// Failure reported by the backend connection
    #[error("backend error: {0}")]
    Backend(String),

    /// The message channel was closed while a send was expected to succeed
    #[error("message channel closed")]
    ChannelClosed,

    /// Serialization/deserialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure (plan read-back, snapshot capture)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether the error is a configuration problem the caller can fix
    /// without any connection having been touched.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            CoreError::MissingBinary(_) | CoreError::MissingWorkspace(_)
        )
    }
}
