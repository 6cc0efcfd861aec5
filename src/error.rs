//! Error types for portwire.

use thiserror::Error;

/// Main error type for all portwire operations.
#[derive(Debug, Error)]
pub enum PortwireError {
    /// I/O error on a byte-stream transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON conversion error (message envelopes and typed payloads).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed message, oversized frame, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A message arrived with a `kind` this peer does not know.
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    /// A future call named an operation nobody registered.
    #[error("Unknown promise function: {0}")]
    UnknownFutureOperation(String),

    /// A stream call named an operation nobody registered.
    #[error("Unknown observable function: {0}")]
    UnknownStreamOperation(String),

    /// Failure raised by a handler.
    #[error("{0}")]
    Handler(String),

    /// Error value delivered by the remote peer in a `rejected` or
    /// `stream_error` message.
    #[error("{}", remote_error_text(.0))]
    Remote(serde_json::Value),

    /// The peer shut down while the call was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The local port was closed before the send.
    #[error("Port closed")]
    PortClosed,

    /// A stream handler failed to produce a stream.
    #[error("Handler did not return a stream: {0}")]
    NotAStream(String),

    /// A handler panicked while running.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl PortwireError {
    /// Build a handler error from anything printable.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        PortwireError::Handler(message.to_string())
    }

    /// The value placed in the `error` field when this error crosses the wire.
    ///
    /// Remote errors are forwarded untouched; everything else travels as its
    /// display string.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            PortwireError::Remote(value) => value.clone(),
            other => serde_json::Value::String(other.to_string()),
        }
    }
}

fn remote_error_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Result type alias using PortwireError.
pub type Result<T> = std::result::Result<T, PortwireError>;
