//! Error types for the parkwatch pipeline
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Live-data feed errors (connect, subscribe, read)
    #[error("Feed error: {0}")]
    Feed(String),

    /// Persistent store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input (malformed feed frame, bad device token, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transport-specific error
    #[error("Transport error ({transport}): {message}")]
    Transport {
        /// Transport name
        transport: String,
        /// Error message
        message: String,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a feed error
    pub fn feed(msg: impl Into<String>) -> Self {
        Self::Feed(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a transport-specific error
    pub fn transport(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            transport: transport.into(),
            message: message.into(),
        }
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = Error::transport("push-http", "connection refused");
        assert_eq!(
            err.to_string(),
            "Transport error (push-http): connection refused"
        );
    }

    #[test]
    fn test_helper_display() {
        assert_eq!(Error::feed("closed").to_string(), "Feed error: closed");
        assert_eq!(Error::store("disk full").to_string(), "Store error: disk full");
        assert_eq!(Error::config("no parks").to_string(), "Configuration error: no parks");
        assert_eq!(Error::not_found("park").to_string(), "Not found: park");
        assert_eq!(
            Error::invalid_input("bad token").to_string(),
            "Invalid input: bad token"
        );
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: Error = anyhow::anyhow!("boom").into();
        assert!(matches!(err, Error::Other(ref m) if m == "boom"));
    }
}
