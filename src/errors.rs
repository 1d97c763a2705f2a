// src/errors.rs

use thiserror::Error;

/// Errors returned to callers of a [`Session`](crate::session::Session).
///
/// Transient infrastructure failures (dial, channel open, queue declare,
/// publish) are retried internally and never surface here; callers only see
/// misuse errors, the shutdown signal, or a transport outcome from the
/// single-attempt publish path.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected to a server")]
    NotConnected,

    #[error("already closed: not connected to the server")]
    AlreadyClosed,

    #[error("session is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors reported by a broker transport implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to connect to broker: {0}")]
    Dial(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("queue declare error: {0}")]
    Declare(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("close error: {0}")]
    Close(String),
}

// Custom Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
