//! Askpass relay error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for askpass relay operations.
pub type AskpassResult<T> = Result<T, AskpassError>;

/// Errors that can occur while relaying a credential prompt.
///
/// A cancelled prompt is not an error: it is reported as
/// [`PromptOutcome::Cancelled`](crate::PromptOutcome::Cancelled).
#[derive(Debug, Error)]
pub enum AskpassError {
    /// The relay socket could not be bound.
    #[error("failed to bind askpass socket {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stub could not reach the relay.
    #[error("failed to connect to askpass relay at {path:?}: {message}")]
    Connect { path: PathBuf, message: String },

    /// A stub gave up waiting for the relay to accept its connection.
    #[error("timed out after {timeout:?} connecting to askpass relay at {path:?}")]
    ConnectTimeout { path: PathBuf, timeout: Duration },

    /// A peer sent something that is not a valid protocol message.
    #[error("malformed askpass message: {0}")]
    MalformedRequest(String),

    /// A peer sent a line longer than the protocol allows.
    #[error("askpass message exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    /// `start()` was called on a server that is already listening.
    #[error("askpass server already started")]
    AlreadyStarted,

    /// `serve()` was called before `start()`.
    #[error("askpass server not started")]
    NotStarted,

    /// The server has been closed.
    #[error("askpass server closed")]
    Closed,

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AskpassError {
    /// Whether the error means the relay could not be reached at all.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::ConnectTimeout { .. })
    }
}
