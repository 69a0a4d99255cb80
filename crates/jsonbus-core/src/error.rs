//! Error types for the bus.
//!
//! Every failure site maps to exactly one variant. Malformed JSON-RPC text is
//! not an error at this level: the codec turns it into a `ParseError`
//! message, and only a parse failure that answers one of our own requests
//! surfaces as [`BusError::ProtocolParse`].

use crate::session::{Role, SessionState};
use jsonbus_proto::{Id, ProtoError};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Main error type for jsonbus.
#[derive(Debug, Error)]
pub enum BusError {
    // Protocol errors
    #[error("Protocol parse error {code}: {message}")]
    ProtocolParse { code: i32, message: String },

    #[error("Handshake failed: {message}")]
    Handshake {
        message: String,
        #[source]
        source: Option<ProtoError>,
    },

    // Session errors
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Transport not ready (state: {state})")]
    TransportNotReady { state: SessionState },

    #[error("Scheme {scheme} does not support the {role} role")]
    UnsupportedRole { scheme: String, role: Role },

    #[error("Request {id} is still awaiting its reply")]
    RequestPending { id: Id },

    #[error("Session closed")]
    Closed,

    // Peer errors
    #[error("Application error {code}: {message}")]
    Application {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Configuration errors
    #[error("Invalid URI {uri}: {message}")]
    InvalidUri { uri: String, message: String },

    #[error("No transport registered for scheme {scheme}")]
    UnknownScheme { scheme: String },

    #[error("Security error: {message}")]
    Security { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

// Conversion implementations for common error types

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for BusError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BusError::Timeout(Duration::from_secs(0))
        } else {
            BusError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BusError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Io(io) => BusError::from(io),
            WsError::Http(response) if response.status().as_u16() == 401 => BusError::Security {
                message: "WebSocket upgrade rejected: unauthorized".to_string(),
            },
            other => BusError::Transport {
                message: other.to_string(),
            },
        }
    }
}

impl From<ProtoError> for BusError {
    fn from(err: ProtoError) -> Self {
        if err.is_negotiation_failure() {
            return BusError::Handshake {
                message: err.to_string(),
                source: Some(err),
            };
        }
        match err {
            ProtoError::InvalidMessage { message } => BusError::ProtocolParse {
                code: jsonbus_proto::codes::INVALID_REQUEST,
                message,
            },
            ProtoError::Closed => BusError::Closed,
            ProtoError::Json { message, source } => BusError::Json { message, source },
            other => BusError::Transport {
                message: other.to_string(),
            },
        }
    }
}

impl BusError {
    /// Shorthand for a transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        BusError::Transport {
            message: message.into(),
        }
    }

    /// Shorthand for an invalid URI.
    pub fn invalid_uri(uri: &str, message: impl Into<String>) -> Self {
        BusError::InvalidUri {
            uri: uri.to_string(),
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Bus error codes (-32000 to -32099):
    /// - -32000: Transport/connectivity error
    /// - -32001: Handshake failure
    /// - -32002: Request already pending
    /// - -32003: Security failure
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            BusError::ProtocolParse { code, .. } | BusError::Application { code, .. } => *code,

            BusError::Timeout(_)
            | BusError::TransportNotReady { .. }
            | BusError::Transport { .. }
            | BusError::Io { .. }
            | BusError::Closed => -32000,

            BusError::Handshake { .. } => -32001,

            BusError::RequestPending { .. } => -32002,

            BusError::Security { .. } => -32003,

            BusError::InvalidUri { .. }
            | BusError::UnknownScheme { .. }
            | BusError::UnsupportedRole { .. } => jsonbus_proto::codes::INVALID_PARAMS,

            BusError::Json { .. } => jsonbus_proto::codes::PARSE_ERROR,
        }
    }

    /// Check if this error should trigger a reconnect attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Transport { .. } | BusError::Io { .. } | BusError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BusError::UnsupportedRole {
            scheme: "http".into(),
            role: Role::Publisher,
        };
        assert_eq!(err.to_string(), "Scheme http does not support the Publisher role");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            BusError::Application {
                code: -32601,
                message: "Method not found".into(),
                data: None
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(BusError::Closed.to_rpc_error_code(), -32000);
        assert_eq!(
            BusError::RequestPending { id: Id::from(1) }.to_rpc_error_code(),
            -32002
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(BusError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(BusError::transport("reset").is_retryable());
        assert!(!BusError::Closed.is_retryable());
        assert!(!BusError::Security {
            message: "denied".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_proto_error_mapping() {
        let err: BusError = ProtoError::SocketMismatch {
            local: "REQ".into(),
            peer: "PUB".into(),
        }
        .into();
        assert!(matches!(err, BusError::Handshake { .. }));

        let err: BusError = ProtoError::Closed.into();
        assert!(matches!(err, BusError::Closed));
    }
}
