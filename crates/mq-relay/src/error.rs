//! Error types for the relay.

use thiserror::Error;

/// Relay error type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Transport-level HTTP error talking to the sink
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The sink answered with a non-success status
    #[error("Sink rejected event: {status} - {body}")]
    Sink {
        /// HTTP status code returned by the sink.
        status: u16,
        /// Response body, truncated for logging.
        body: String,
    },

    /// IO error (log file, signals)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error (structured content mode)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed data returned by the queue manager
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session-level failure (connect, open, close, disconnect)
    #[error("Session error: {0}")]
    Session(String),

    /// Commit, backout or forward failed, or a transaction was misused
    #[error("Transaction error: {0}")]
    Transaction(String),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
