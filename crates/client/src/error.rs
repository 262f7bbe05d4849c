//! Error types for the requestd client.

use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while brokering calls to the network service.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level error (framing, pipe I/O).
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Protocol-level error (malformed or uncorrelatable message).
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The remote service rejected a call.
    #[error("{name}: {message}")]
    Remote {
        /// Error type name reported by the service.
        name: String,
        /// Human-readable error message.
        message: String,
    },

    /// The service refused a WebSocket connect (negative connection id).
    #[error("WebSocket connect refused by service (id {0})")]
    ConnectRefused(i32),

    /// A correlation or event channel closed before the result arrived.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Timeout waiting for an event.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
