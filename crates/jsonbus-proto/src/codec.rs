//! Canonical JSON-RPC 2.0 text encoding and tolerant decoding.
//!
//! Encoding always writes members in the order `jsonrpc`, `id`, `method`,
//! `params`, `result`, `error`, `metadata`. Decoding accepts a single object
//! or a batch array; every batch element decodes on its own, so one bad
//! element becomes a [`ParseError`] and the rest survive.
//!
//! ```
//! use jsonbus_proto::codec;
//! use jsonbus_proto::{Message, Request};
//! use serde_json::json;
//!
//! let text = codec::encode(&Request::new(1, "subtract").with_params(json!([42, 23])).into());
//! let decoded = codec::decode(&text);
//! assert_eq!(decoded.len(), 1);
//! assert!(matches!(decoded[0], Message::Request(_)));
//! ```

use crate::message::{
    ErrorObject, Id, Message, Metadata, Notification, ParseError, Reply, ReplyBody, Request,
    JSONRPC_VERSION,
};
use serde_json::{Map, Value};
use tracing::debug;

/// How strictly reply shapes are checked while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// A reply with both `result` and `error` becomes a [`ParseError`].
    Strict,
    /// Such a reply is kept as [`ReplyBody::Malformed`].
    Lenient,
}

// ============================================================================
// Encoding
// ============================================================================

/// Convert a message into its JSON object form.
pub fn to_value(message: &Message) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".to_string(), Value::String(JSONRPC_VERSION.to_string()));

    match message {
        Message::Request(req) => {
            obj.insert("id".to_string(), req.id().to_value());
            obj.insert("method".to_string(), Value::String(req.method().to_string()));
            if let Some(params) = req.params() {
                obj.insert("params".to_string(), params.clone());
            }
            insert_metadata(&mut obj, req.metadata());
        }
        Message::Notification(note) => {
            obj.insert("method".to_string(), Value::String(note.method().to_string()));
            if let Some(params) = note.params() {
                obj.insert("params".to_string(), params.clone());
            }
            insert_metadata(&mut obj, note.metadata());
        }
        Message::Reply(reply) => {
            obj.insert("id".to_string(), id_or_null(reply.id()));
            match reply.body() {
                ReplyBody::Result(result) => {
                    obj.insert("result".to_string(), result.clone());
                }
                ReplyBody::Error(error) => {
                    obj.insert("error".to_string(), error_to_value(error));
                }
                ReplyBody::Malformed { result, error } => {
                    obj.insert("result".to_string(), result.clone());
                    obj.insert("error".to_string(), error.clone());
                }
            }
            insert_metadata(&mut obj, reply.metadata());
        }
        Message::ParseError(parse) => {
            obj.insert("id".to_string(), id_or_null(parse.id()));
            obj.insert("error".to_string(), error_to_value(parse.error()));
        }
    }

    Value::Object(obj)
}

/// Encode one message as compact JSON text.
pub fn encode(message: &Message) -> String {
    to_value(message).to_string()
}

/// Encode a batch as a JSON array.
pub fn encode_batch(messages: &[Message]) -> String {
    Value::Array(messages.iter().map(to_value).collect()).to_string()
}

fn id_or_null(id: Option<&Id>) -> Value {
    id.map(Id::to_value).unwrap_or(Value::Null)
}

fn insert_metadata(obj: &mut Map<String, Value>, metadata: Option<&Metadata>) {
    if let Some(meta) = metadata {
        obj.insert("metadata".to_string(), Value::Object(meta.clone()));
    }
}

fn error_to_value(error: &ErrorObject) -> Value {
    // ErrorObject only holds plain JSON types, serialization cannot fail.
    serde_json::to_value(error).unwrap_or(Value::Null)
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode text in strict mode. Never fails; bad input becomes `ParseError`.
pub fn decode(text: &str) -> Vec<Message> {
    decode_with(text, DecodeMode::Strict)
}

/// Decode text keeping malformed replies for inspection.
pub fn decode_lenient(text: &str) -> Vec<Message> {
    decode_with(text, DecodeMode::Lenient)
}

/// Decode text with an explicit mode.
pub fn decode_with(text: &str, mode: DecodeMode) -> Vec<Message> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("Unparsable JSON-RPC text: {}", e);
            return vec![Message::ParseError(ParseError::new(
                None,
                ErrorObject::parse_error(e),
            ))];
        }
    };
    decode_value_batch(&value, mode)
}

/// Whether the text is a batch (JSON array) on the wire.
///
/// Servers use this to decide whether to answer with an array.
pub fn is_batch(text: &str) -> bool {
    text.trim_start().starts_with('[')
}

/// Decode an already parsed JSON value (object or batch array).
pub fn decode_value_batch(value: &Value, mode: DecodeMode) -> Vec<Message> {
    match value {
        Value::Array(items) if items.is_empty() => vec![Message::ParseError(ParseError::new(
            None,
            ErrorObject::invalid_request("empty batch"),
        ))],
        Value::Array(items) => items.iter().map(|item| decode_value(item, mode)).collect(),
        other => vec![decode_value(other, mode)],
    }
}

/// Decode a single JSON value into a message.
pub fn decode_value(value: &Value, mode: DecodeMode) -> Message {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => {
            return parse_error(None, ErrorObject::invalid_request("expected a JSON object"));
        }
    };

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(Id::coerce(raw)),
    };

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => {
            return parse_error(
                id,
                ErrorObject::parse_error(format!("unsupported jsonrpc version {}", other)),
            );
        }
        None => {
            return parse_error(id, ErrorObject::parse_error("missing jsonrpc version"));
        }
    }

    let metadata = match obj.get("metadata") {
        Some(Value::Object(meta)) => Some(meta.clone()),
        Some(Value::Null) | None => None,
        Some(_) => {
            return parse_error(id, ErrorObject::invalid_request("metadata must be an object"));
        }
    };

    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    if let Some(method) = obj.get("method") {
        let method = match method.as_str() {
            Some(m) if !m.is_empty() => m,
            _ => {
                return parse_error(
                    id,
                    ErrorObject::invalid_request("method must be a non-empty string"),
                )
            }
        };
        if has_result || has_error {
            return parse_error(
                id,
                ErrorObject::parse_error("request carries result or error"),
            );
        }
        let params = obj.get("params").cloned();
        return match id {
            Some(id) => {
                let mut req = Request::new(id, method);
                if let Some(p) = params {
                    req = req.with_params(p);
                }
                if let Some(meta) = metadata {
                    req = req.with_metadata(meta);
                }
                Message::Request(req)
            }
            None => {
                let mut note = Notification::new(method);
                if let Some(p) = params {
                    note = note.with_params(p);
                }
                if let Some(meta) = metadata {
                    note = note.with_metadata(meta);
                }
                Message::Notification(note)
            }
        };
    }

    let reply = match (obj.get("result"), obj.get("error")) {
        (Some(result), Some(error)) => match mode {
            DecodeMode::Strict => {
                return parse_error(
                    id,
                    ErrorObject::parse_error("reply carries both result and error")
                        .with_data(value.clone()),
                );
            }
            DecodeMode::Lenient => Reply::malformed(id, result.clone(), error.clone()),
        },
        (Some(result), None) => match id {
            Some(id) => Reply::success(id, result.clone()),
            None => {
                return parse_error(None, ErrorObject::invalid_request("result reply without id"));
            }
        },
        // An error reply stays a reply whatever its code; mapping parse codes
        // to a failure is up to whoever awaits it.
        (None, Some(error)) => match serde_json::from_value::<ErrorObject>(error.clone()) {
            Ok(error) => Reply::failure(id, error),
            Err(e) => {
                return parse_error(
                    id,
                    ErrorObject::invalid_request(format!("malformed error object: {}", e)),
                );
            }
        },
        (None, None) => {
            return parse_error(
                id,
                ErrorObject::invalid_request("object has no method, result or error"),
            );
        }
    };

    Message::Reply(match metadata {
        Some(meta) => reply.with_metadata(meta),
        None => reply,
    })
}

fn parse_error(id: Option<Id>, error: ErrorObject) -> Message {
    debug!("JSON-RPC decode failure: {}", error);
    Message::ParseError(ParseError::new(id, error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{codes, MessageKind};
    use serde_json::json;

    fn single(text: &str) -> Message {
        let mut out = decode(text);
        assert_eq!(out.len(), 1, "expected a single message from {}", text);
        out.remove(0)
    }

    #[test]
    fn test_subtract_request_roundtrip() {
        let req = Request::new(1, "subtract").with_params(json!([42, 23]));
        let text = encode(&req.clone().into());
        match single(&text) {
            Message::Request(decoded) => {
                assert_eq!(decoded.id(), &Id::Number(1));
                assert_eq!(decoded.method(), "subtract");
                assert_eq!(decoded.params(), Some(&json!([42, 23])));
                assert_eq!(decoded, req);
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_all_kinds_roundtrip() {
        let mut meta = Metadata::new();
        meta.insert("trace".into(), json!("abc"));
        let messages: Vec<Message> = vec![
            Request::new("r-1", "echo")
                .with_params(json!({"x": 5}))
                .with_metadata(meta.clone())
                .into(),
            Notification::new("tick").with_params(json!([1])).into(),
            Reply::success(9, json!({"ok": true})).with_metadata(meta).into(),
            Reply::failure(Some(Id::Number(4)), ErrorObject::new(-32001, "nope")).into(),
            Reply::failure(Some(Id::Number(5)), ErrorObject::invalid_request("bad")).into(),
            Reply::failure(None, ErrorObject::parse_error("eof")).into(),
        ];
        for m in messages {
            let decoded = single(&encode(&m));
            assert_eq!(decoded, m);
        }
    }

    #[test]
    fn test_parse_error_decodes_as_its_error_reply() {
        // On the wire a parse failure is the error reply that answers it
        for parse in [
            ParseError::new(Some(Id::Number(2)), ErrorObject::new(codes::METHOD_NOT_FOUND, "x")),
            ParseError::new(None, ErrorObject::parse_error("eof")),
        ] {
            let decoded = single(&encode(&parse.clone().into()));
            assert_eq!(decoded, Message::Reply(parse.to_reply()));
            assert_eq!(decoded.id(), parse.id());
        }
    }

    #[test]
    fn test_canonical_member_order() {
        let text = encode(&Request::new(1, "m").with_params(json!([])).into());
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":1,"method":"m","params":[]}"#);
    }

    #[test]
    fn test_notification_never_encodes_id() {
        let text = encode(&Notification::new("update").into());
        assert!(!text.contains("\"id\""));
        assert_eq!(
            single(r#"{"jsonrpc":"2.0","method":"update"}"#).kind(),
            MessageKind::Notification
        );
    }

    #[test]
    fn test_batch_with_malformed_element() {
        let text = r#"[
            {"jsonrpc":"2.0","id":1,"method":"a"},
            {"jsonrpc":"2.0","id":2,"method":"b","result":1},
            42,
            {"jsonrpc":"1.0","id":3,"method":"c"},
            {"jsonrpc":"2.0","method":"d"}
        ]"#;
        let out = decode(text);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].kind(), MessageKind::Request);
        assert_eq!(out[1].kind(), MessageKind::ParseError);
        assert_eq!(out[1].id(), Some(&Id::Number(2)));
        assert_eq!(out[2].kind(), MessageKind::ParseError);
        assert_eq!(out[3].kind(), MessageKind::ParseError);
        assert_eq!(out[4].kind(), MessageKind::Notification);
    }

    #[test]
    fn test_batch_of_requests_keeps_count() {
        let batch: Vec<Message> = (0..5)
            .map(|i| Request::new(i, "m").into())
            .collect();
        let out = decode(&encode_batch(&batch));
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|m| m.kind() == MessageKind::Request));
    }

    #[test]
    fn test_unparsable_text() {
        match single("{not json") {
            Message::ParseError(p) => assert_eq!(p.code(), codes::PARSE_ERROR),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_version() {
        match single(r#"{"id":1,"method":"x"}"#) {
            Message::ParseError(p) => {
                assert_eq!(p.code(), codes::PARSE_ERROR);
                assert_eq!(p.id(), Some(&Id::Number(1)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reply_with_both_members_strict_and_lenient() {
        let text = r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#;
        assert_eq!(single(text).kind(), MessageKind::ParseError);

        let lenient = decode_lenient(text);
        match &lenient[0] {
            Message::Reply(r) => assert!(r.is_malformed()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_reply_encodes_both_members() {
        let reply = Reply::malformed(Some(Id::Number(1)), json!(1), json!({"code": 2, "message": "m"}));
        let text = encode(&reply.clone().into());
        assert!(text.contains("\"result\""));
        assert!(text.contains("\"error\""));
        assert_eq!(decode_lenient(&text)[0], Message::Reply(reply));
    }

    #[test]
    fn test_empty_batch_is_invalid() {
        match single("[]") {
            Message::ParseError(p) => assert_eq!(p.code(), codes::INVALID_REQUEST),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_id_coerced() {
        match single(r#"{"jsonrpc":"2.0","id":{"x":1},"method":"m"}"#) {
            Message::Request(r) => assert_eq!(r.id(), &Id::SENTINEL),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_is_batch() {
        assert!(is_batch("  [1]"));
        assert!(!is_batch("{}"));
    }
}
