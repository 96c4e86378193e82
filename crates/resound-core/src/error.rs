//! Error types for the broadcast engine.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the broadcast engine.
///
/// Downstream-relay failures are deliberately coarse: they are absorbed into
/// health statistics and never surfaced past the component that saw them.
#[derive(Error, Debug)]
pub enum Error {
    /// Websocket transport error (connect, send, or receive).
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Outbound operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Relay answered a publish with `["OK", id, false, reason]`.
    #[error("publish rejected: {0}")]
    PublishRejected(String),

    /// Malformed or non-websocket relay URL.
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
