//! Error types for the datebook store.

use thiserror::Error;

/// Errors that can occur in store operations.
///
/// Payloads are plain strings so the same error can be logged and handed to
/// every listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Could not connect to '{source_name}': {reason}")]
    Connection { source_name: String, reason: String },

    #[error("Connecting to '{0}' was cancelled")]
    Cancelled(String),

    #[error("Connecting to '{0}' timed out after {1}s")]
    Timeout(String, u64),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Could not create component: {0}")]
    Create(String),

    #[error("Could not modify component: {0}")]
    Modify(String),

    #[error("Could not remove component: {0}")]
    Remove(String),

    #[error("No client connected for source '{0}'")]
    NoClient(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Recurrence error: {0}")]
    Recurrence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Preferences error: {0}")]
    Preferences(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
