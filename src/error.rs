//! Error types for the live match channel and server startup.

use thiserror::Error;

/// Errors that can occur on a live connection or while bringing the server up.
#[derive(Debug, Error)]
pub enum StackfallError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Invalid server configuration (bad bind address, missing secret, etc.).
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for live-channel and startup operations.
pub type Result<T> = std::result::Result<T, StackfallError>;
