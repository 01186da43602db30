//! Error types shared across Schoolbell crates.

use std::time::Duration;

use crate::types::Channel;

/// Errors raised by the engine, its store and its configuration layer.
#[derive(Debug, thiserror::Error)]
pub enum SchoolbellError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Caller referenced a category id that the catalog does not define.
    #[error("Unknown notification category: {0}")]
    UnknownCategory(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Outcome of a single provider call that did not deliver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("channel {0} is not configured")]
    Unavailable(Channel),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, SchoolbellError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_display() {
        let e = SendError::Timeout(Duration::from_secs(15));
        assert_eq!(e.to_string(), "provider timed out after 15s");
        let e = SendError::Unavailable(Channel::Email);
        assert_eq!(e.to_string(), "channel email is not configured");
    }
}
