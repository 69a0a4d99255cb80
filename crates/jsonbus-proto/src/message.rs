//! JSON-RPC 2.0 message model.
//!
//! Four message kinds travel on the bus:
//!
//! - [`Request`]: carries an id and expects exactly one [`Reply`]
//! - [`Notification`]: a method call with no id, never answered
//! - [`Reply`]: a `result` or an `error` for a previously sent request
//! - [`ParseError`]: input that could not be understood, kept in-band so a
//!   batch with one bad element still yields the other elements
//!
//! Messages are immutable once built. [`MessageBuilder`] is the single place
//! where the shape invariants are enforced.

use crate::error::{ProtoError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

/// Protocol version token carried in every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Out-of-band metadata object attached to a message.
pub type Metadata = Map<String, Value>;

// ============================================================================
// Identifiers
// ============================================================================

/// Request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

impl Id {
    /// Placeholder returned when a peer sends an id we cannot represent.
    pub const SENTINEL: Id = Id::Number(-1);

    /// Strict conversion: only integers and strings are ids.
    pub fn from_value(value: &Value) -> Option<Id> {
        match value {
            Value::Number(n) => n.as_i64().map(Id::Number),
            Value::String(s) => Some(Id::String(s.clone())),
            _ => None,
        }
    }

    /// Lenient conversion used on the decode path.
    ///
    /// Never fails: integral floats are truncated to integers, anything else
    /// collapses to [`Id::SENTINEL`] and is logged.
    pub fn coerce(value: &Value) -> Id {
        if let Some(id) = Id::from_value(value) {
            return id;
        }
        if let Some(f) = value.as_f64() {
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                return Id::Number(f as i64);
            }
        }
        warn!("Unusable JSON-RPC id {}, substituting sentinel", value);
        Id::SENTINEL
    }

    pub fn to_value(&self) -> Value {
        match self {
            Id::Number(n) => Value::from(*n),
            Id::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{}", n),
            Id::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Number(n)
    }
}

impl From<i32> for Id {
    fn from(n: i32) -> Self {
        Id::Number(n.into())
    }
}

impl From<u32> for Id {
    fn from(n: u32) -> Self {
        Id::Number(n.into())
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::String(s.to_string())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::String(s)
    }
}

// ============================================================================
// Error object
// ============================================================================

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl fmt::Display) -> Self {
        Self::new(codes::PARSE_ERROR, format!("Parse error: {}", detail))
    }

    pub fn invalid_request(detail: impl fmt::Display) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("Invalid Request: {}", detail))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Invalid params: {}", detail))
    }

    pub fn internal(detail: impl fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, format!("Internal error: {}", detail))
    }

    /// Whether the code is one of the protocol-level parse codes.
    pub fn is_protocol_parse(&self) -> bool {
        self.code == codes::PARSE_ERROR || self.code == codes::INVALID_REQUEST
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// ============================================================================
// Message kinds
// ============================================================================

/// A method call that expects a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    id: Id,
    method: String,
    params: Option<Value>,
    metadata: Option<Metadata>,
}

impl Request {
    pub fn new(id: impl Into<Id>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params: None,
            metadata: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }
}

/// A method call without an id. Never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    method: String,
    params: Option<Value>,
    metadata: Option<Metadata>,
}

impl Notification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            metadata: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }
}

/// Outcome carried by a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Result(Value),
    Error(ErrorObject),
    /// Both `result` and `error` present. Only produced by the lenient
    /// decode path and [`Reply::malformed`], for negative testing.
    Malformed { result: Value, error: Value },
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    id: Option<Id>,
    body: ReplyBody,
    metadata: Option<Metadata>,
}

impl Reply {
    pub fn success(id: impl Into<Id>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            body: ReplyBody::Result(result),
            metadata: None,
        }
    }

    /// Error reply. `id` is `None` when the request id could not be read.
    pub fn failure(id: Option<Id>, error: ErrorObject) -> Self {
        Self {
            id,
            body: ReplyBody::Error(error),
            metadata: None,
        }
    }

    /// Reply carrying both members, bypassing the builder's check.
    pub fn malformed(id: Option<Id>, result: Value, error: Value) -> Self {
        Self {
            id,
            body: ReplyBody::Malformed { result, error },
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    pub fn body(&self) -> &ReplyBody {
        &self.body
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.body {
            ReplyBody::Result(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match &self.body {
            ReplyBody::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self.body, ReplyBody::Malformed { .. })
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Split into the result value or the peer's error object.
    pub fn into_result(self) -> std::result::Result<Value, ErrorObject> {
        match self.body {
            ReplyBody::Result(v) => Ok(v),
            ReplyBody::Error(e) => Err(e),
            ReplyBody::Malformed { .. } => Err(ErrorObject::invalid_request(
                "reply carries both result and error",
            )),
        }
    }
}

/// Input that failed to decode.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    id: Option<Id>,
    error: ErrorObject,
}

impl ParseError {
    pub fn new(id: Option<Id>, error: ErrorObject) -> Self {
        Self { id, error }
    }

    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    pub fn code(&self) -> i32 {
        self.error.code
    }

    pub fn message(&self) -> &str {
        &self.error.message
    }

    pub fn data(&self) -> Option<&Value> {
        self.error.data.as_ref()
    }

    pub fn error(&self) -> &ErrorObject {
        &self.error
    }

    /// The error reply a server sends back for this input.
    pub fn to_reply(&self) -> Reply {
        Reply::failure(self.id.clone(), self.error.clone())
    }
}

/// Discriminant of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Reply,
    ParseError,
}

/// Any message the bus can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Reply(Reply),
    ParseError(ParseError),
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Notification(_) => MessageKind::Notification,
            Message::Reply(_) => MessageKind::Reply,
            Message::ParseError(_) => MessageKind::ParseError,
        }
    }

    pub fn id(&self) -> Option<&Id> {
        match self {
            Message::Request(r) => Some(r.id()),
            Message::Notification(_) => None,
            Message::Reply(r) => r.id(),
            Message::ParseError(p) => p.id(),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(r.method()),
            Message::Notification(n) => Some(n.method()),
            _ => None,
        }
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        match self {
            Message::Request(r) => r.metadata(),
            Message::Notification(n) => n.metadata(),
            Message::Reply(r) => r.metadata(),
            Message::ParseError(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Message::Notification(n)
    }
}

impl From<Reply> for Message {
    fn from(r: Reply) -> Self {
        Message::Reply(r)
    }
}

impl From<ParseError> for Message {
    fn from(p: ParseError) -> Self {
        Message::ParseError(p)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder that picks the message kind from the members set on it.
///
/// - `method` + `id` → [`Request`]
/// - `method` without `id` → [`Notification`]
/// - `id` + exactly one of `result`/`error` → [`Reply`]
///
/// Every other combination is rejected.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    id: Option<Id>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<ErrorObject>,
    metadata: Option<Metadata>,
}

impl MessageBuilder {
    pub fn id(mut self, id: impl Into<Id>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: ErrorObject) -> Self {
        self.error = Some(error);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn build(self) -> Result<Message> {
        match self.method {
            Some(method) => {
                if method.is_empty() {
                    return Err(ProtoError::invalid("method name is empty"));
                }
                if self.result.is_some() || self.error.is_some() {
                    return Err(ProtoError::invalid(
                        "a method call cannot carry result or error",
                    ));
                }
                match self.id {
                    Some(id) => Ok(Message::Request(Request {
                        id,
                        method,
                        params: self.params,
                        metadata: self.metadata,
                    })),
                    None => Ok(Message::Notification(Notification {
                        method,
                        params: self.params,
                        metadata: self.metadata,
                    })),
                }
            }
            None => {
                if self.params.is_some() {
                    return Err(ProtoError::invalid("params without a method"));
                }
                let body = match (self.result, self.error) {
                    (Some(result), None) => ReplyBody::Result(result),
                    (None, Some(error)) => ReplyBody::Error(error),
                    (Some(_), Some(_)) => {
                        return Err(ProtoError::invalid(
                            "a reply carries exactly one of result or error",
                        ))
                    }
                    (None, None) => {
                        return Err(ProtoError::invalid(
                            "a message needs a method, a result or an error",
                        ))
                    }
                };
                if self.id.is_none() && matches!(body, ReplyBody::Result(_)) {
                    return Err(ProtoError::invalid("a successful reply needs an id"));
                }
                Ok(Message::Reply(Reply {
                    id: self.id,
                    body,
                    metadata: self.metadata,
                }))
            }
        }
    }
}
