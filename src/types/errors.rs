//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the shard coordination layer.
#[derive(Error, Debug)]
pub enum Error {
    /// The gateway has no live transport at call time.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// No response arrived before the request deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The target shard is alive but has no handler for the event.
    #[error("no handler registered for event: {event}")]
    HandlerMissing { event: String },

    /// The target handler failed while running; carries the stringified error.
    #[error("handler failed: {0}")]
    HandlerFailed(String),

    /// Pending work was abandoned (gateway cleanup).
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Publish/subscribe failures reported by the bus.
    #[error("transport error: {0}")]
    Transport(String),

    /// Validation errors.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a caller may reasonably retry the same call later.
    ///
    /// Handler failures are deterministic on the remote side, so they are
    /// not retryable; transport level conditions are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotConnected(_) | Error::Timeout(_) | Error::Transport(_)
        )
    }
}

// Convenience constructors
impl Error {
    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::NotConnected(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn handler_missing(event: impl Into<String>) -> Self {
        Self::HandlerMissing {
            event: event.into(),
        }
    }

    pub fn handler_failed(msg: impl Into<String>) -> Self {
        Self::HandlerFailed(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
