//! Error types for the protocol layer.
//!
//! Message-building violations and binary wire failures live here. Decoding
//! JSON-RPC text never produces a `ProtoError`: malformed input is
//! materialized as a `Message::ParseError` so batches keep going.

use thiserror::Error;

/// Error type for message construction and the wire protocol engine.
#[derive(Debug, Error)]
pub enum ProtoError {
    // Message model errors
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    // Wire protocol errors
    #[error("Greeting failed: {message}")]
    Greeting { message: String },

    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    #[error("Socket type mismatch: local {local} cannot talk to peer {peer}")]
    SocketMismatch { local: String, peer: String },

    #[error("Authentication rejected: {reason}")]
    AuthRejected { reason: String },

    #[error("Frame error: {message}")]
    Frame { message: String },

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("Data frame before handshake completed")]
    PrematureData,

    #[error("Wire engine not ready (state: {state})")]
    NotReady { state: String },

    #[error("Wire engine closed")]
    Closed,

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        ProtoError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ProtoError {
    /// Shorthand for an invalid-message error.
    pub fn invalid(message: impl Into<String>) -> Self {
        ProtoError::InvalidMessage {
            message: message.into(),
        }
    }

    /// Whether this error happened before the wire reached steady state.
    ///
    /// Negotiation failures always reset the connection.
    pub fn is_negotiation_failure(&self) -> bool {
        matches!(
            self,
            ProtoError::Greeting { .. }
                | ProtoError::Handshake { .. }
                | ProtoError::SocketMismatch { .. }
                | ProtoError::AuthRejected { .. }
                | ProtoError::PrematureData
        )
    }
}
