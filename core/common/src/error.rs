//! Common error types for the offline sync engine.

use thiserror::Error;

/// Top-level error type for sync engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connecting to or sending over the transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An inbound message could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The remote system rejected a queued action.
    #[error("Action {action_id} failed{}: {message}", status_suffix(.status))]
    ActionExecution {
        action_id: String,
        status: Option<u16>,
        message: String,
    },

    /// A conflict resolver failed to produce a resolution.
    #[error("Conflict resolution error: {0}")]
    ConflictResolution(String),

    /// Durable storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The sync channel is not open.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// A bounded queue had no room for a new entry.
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// An operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|code| format!(" with status {}", code))
        .unwrap_or_default()
}

impl Error {
    /// Whether retrying the failed operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Io(_) | Error::NotConnected(_) | Error::Timeout(_) => true,
            Error::ActionExecution { status, .. } => match status {
                None => true,
                Some(code) => *code == 408 || *code == 429 || *code >= 500,
            },
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
