//! Inbound call dispatch for Responder sessions.
//!
//! Method routing is an explicit table built once. The [`Dispatcher`] turns
//! request text (single or batch) into reply text, calling the handler for
//! each request and notification.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use jsonbus_proto::codec::{self, DecodeMode};
use jsonbus_proto::{CompatRules, ErrorObject, Id, Message, Metadata, ParseError, Reply};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Identifier of one peer connection on a server session.
pub type PeerId = u64;

/// Who sent an inbound call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerContext {
    pub id: PeerId,
    pub addr: Option<SocketAddr>,
    /// Authenticated username, if any.
    pub user: Option<String>,
}

/// One inbound request or notification.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub method: String,
    pub params: Value,
    /// `None` for notifications.
    pub id: Option<Id>,
    pub metadata: Option<Metadata>,
    pub peer: PeerContext,
}

impl IncomingCall {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Get a string parameter, accepting snake_case or camelCase keys.
    pub fn str_param(&self, key: &str, alt_key: &str) -> Option<&str> {
        self.params
            .get(key)
            .or_else(|| self.params.get(alt_key))
            .and_then(Value::as_str)
    }

    /// Deserialize the params, mapping failures to `-32602`.
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, ErrorObject> {
        serde_json::from_value(self.params.clone()).map_err(ErrorObject::invalid_params)
    }
}

/// Application code invoked for inbound calls.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, call: IncomingCall) -> Result<Value, ErrorObject>;
}

type MethodFn =
    Arc<dyn Fn(IncomingCall) -> BoxFuture<'static, Result<Value, ErrorObject>> + Send + Sync>;

/// Handlers keyed by method name. Frozen once built.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodFn>,
}

impl MethodTable {
    pub fn builder() -> MethodTableBuilder {
        MethodTableBuilder::default()
    }

    /// A table that answers every call with "method not found".
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

#[async_trait]
impl RequestHandler for MethodTable {
    async fn handle(&self, call: IncomingCall) -> Result<Value, ErrorObject> {
        match self.methods.get(&call.method) {
            Some(method) => method(call).await,
            None => Err(ErrorObject::method_not_found(&call.method)),
        }
    }
}

/// Builder for [`MethodTable`].
#[derive(Default)]
pub struct MethodTableBuilder {
    methods: HashMap<String, MethodFn>,
}

impl MethodTableBuilder {
    /// Register `name`. A later registration of the same name wins.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorObject>> + Send + 'static,
    {
        let f: MethodFn = Arc::new(move |call| Box::pin(f(call)));
        self.methods.insert(name.into(), f);
        self
    }

    pub fn build(self) -> MethodTable {
        MethodTable {
            methods: self.methods,
        }
    }
}

/// Routes decoded messages to the current handler and builds replies.
pub struct Dispatcher {
    handler: RwLock<Arc<dyn RequestHandler>>,
    compat: CompatRules,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn RequestHandler>, compat: CompatRules) -> Self {
        Self {
            handler: RwLock::new(handler),
            compat,
        }
    }

    /// Replace the handler; calls already running finish on the old one.
    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        let mut slot = self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = handler;
    }

    fn handler(&self) -> Arc<dyn RequestHandler> {
        self.handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Handle request text and return the reply text, if any.
    ///
    /// Batches are answered with an array of the non-notification replies;
    /// a batch of notifications only produces nothing.
    pub async fn handle_text(&self, text: &str, peer: &PeerContext) -> Option<String> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("Unparsable request from peer {}: {}", peer.id, e);
                let reply = ParseError::new(None, ErrorObject::parse_error(e)).to_reply();
                return Some(codec::encode(&reply.into()));
            }
        };

        let is_batch = matches!(&value, Value::Array(items) if !items.is_empty());
        let messages = codec::decode_value_batch(&value, DecodeMode::Strict);

        let replies: Vec<Message> = join_all(messages.into_iter().map(|m| self.process(m, peer)))
            .await
            .into_iter()
            .flatten()
            .map(Message::Reply)
            .collect();

        if is_batch {
            if replies.is_empty() {
                None
            } else {
                Some(codec::encode_batch(&replies))
            }
        } else {
            replies.first().map(codec::encode)
        }
    }

    async fn process(&self, message: Message, peer: &PeerContext) -> Option<Reply> {
        match message {
            Message::Request(req) => {
                let method = req.method().to_string();
                let id = req.id().clone();
                let params = req.params().cloned().unwrap_or(Value::Null);
                let call = IncomingCall {
                    params: self.compat.inbound_params(&method, params),
                    method: method.clone(),
                    id: Some(id.clone()),
                    metadata: req.metadata().cloned(),
                    peer: peer.clone(),
                };

                debug!("RPC call: {} (id {}) from peer {}", method, id, peer.id);
                let reply = match self.handler().handle(call).await {
                    Ok(result) => Reply::success(id, self.compat.outbound_result(&method, result)),
                    Err(error) => {
                        debug!("RPC {} failed: {}", method, error);
                        Reply::failure(Some(id), error)
                    }
                };
                Some(reply)
            }
            Message::Notification(note) => {
                let method = note.method().to_string();
                let params = note.params().cloned().unwrap_or(Value::Null);
                let call = IncomingCall {
                    params: self.compat.inbound_params(&method, params),
                    method: method.clone(),
                    id: None,
                    metadata: note.metadata().cloned(),
                    peer: peer.clone(),
                };
                if let Err(error) = self.handler().handle(call).await {
                    debug!("Notification {} failed: {}", method, error);
                }
                None
            }
            Message::ParseError(parse) => {
                warn!("Rejecting message from peer {}: {}", peer.id, parse.error());
                Some(parse.to_reply())
            }
            Message::Reply(reply) => {
                debug!(
                    "Responder ignoring reply {:?} from peer {}",
                    reply.id().map(ToString::to_string),
                    peer.id
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> MethodTable {
        MethodTable::builder()
            .method("subtract", |call: IncomingCall| async move {
                let args: (i64, i64) = call.parse_params()?;
                Ok(json!(args.0 - args.1))
            })
            .method("echo", |call: IncomingCall| async move { Ok(call.params) })
            .method("fail", |_call: IncomingCall| async move {
                Err(ErrorObject::new(-32010, "boom"))
            })
            .build()
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(table()), CompatRules::new())
    }

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_single_request() {
        let out = dispatcher()
            .handle_text(
                r#"{"jsonrpc":"2.0","id":1,"method":"subtract","params":[42,23]}"#,
                &PeerContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out, r#"{"jsonrpc":"2.0","id":1,"result":19}"#);
    }

    #[tokio::test]
    async fn test_notification_has_no_reply() {
        let out = dispatcher()
            .handle_text(
                r#"{"jsonrpc":"2.0","method":"echo","params":[1]}"#,
                &PeerContext::default(),
            )
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method_and_app_error() {
        let d = dispatcher();
        let out = d
            .handle_text(r#"{"jsonrpc":"2.0","id":"a","method":"nope"}"#, &PeerContext::default())
            .await
            .unwrap();
        assert_eq!(parse(&out)["error"]["code"], json!(-32601));

        let out = d
            .handle_text(r#"{"jsonrpc":"2.0","id":2,"method":"fail"}"#, &PeerContext::default())
            .await
            .unwrap();
        assert_eq!(parse(&out)["error"]["code"], json!(-32010));
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let out = dispatcher()
            .handle_text(
                r#"{"jsonrpc":"2.0","id":3,"method":"subtract","params":{"a":1}}"#,
                &PeerContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(parse(&out)["error"]["code"], json!(-32602));
    }

    #[tokio::test]
    async fn test_batch_mixed() {
        let text = r#"[
            {"jsonrpc":"2.0","id":1,"method":"subtract","params":[5,3]},
            {"jsonrpc":"2.0","method":"echo","params":[0]},
            {"foo":"bar"},
            {"jsonrpc":"2.0","id":2,"method":"echo","params":["x"]}
        ]"#;
        let out = dispatcher()
            .handle_text(text, &PeerContext::default())
            .await
            .unwrap();
        let replies = parse(&out);
        let replies = replies.as_array().unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0]["result"], json!(2));
        assert_eq!(replies[1]["error"]["code"], json!(-32700));
        assert_eq!(replies[2]["result"], json!(["x"]));
    }

    #[tokio::test]
    async fn test_batch_of_notifications() {
        let text = r#"[{"jsonrpc":"2.0","method":"echo"},{"jsonrpc":"2.0","method":"echo"}]"#;
        assert!(dispatcher()
            .handle_text(text, &PeerContext::default())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_parse_failures() {
        let d = dispatcher();
        let out = d.handle_text("{not json", &PeerContext::default()).await.unwrap();
        let reply = parse(&out);
        assert_eq!(reply["error"]["code"], json!(-32700));
        assert_eq!(reply["id"], Value::Null);

        // An empty batch is answered with a single error object
        let out = d.handle_text("[]", &PeerContext::default()).await.unwrap();
        assert_eq!(parse(&out)["error"]["code"], json!(-32600));
    }

    #[tokio::test]
    async fn test_handler_swap() {
        let d = dispatcher();
        let replacement = MethodTable::builder()
            .method("subtract", |_call: IncomingCall| async move { Ok(json!("swapped")) })
            .build();
        d.set_handler(Arc::new(replacement));

        let out = d
            .handle_text(
                r#"{"jsonrpc":"2.0","id":1,"method":"subtract","params":[1,1]}"#,
                &PeerContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(parse(&out)["result"], json!("swapped"));
    }

    #[tokio::test]
    async fn test_compat_rules_applied() {
        let compat = CompatRules::new()
            .params_field("set_level", "level")
            .result_field("set_level", "level");
        let table = MethodTable::builder()
            .method("set_level", |call: IncomingCall| async move {
                assert_eq!(call.params, json!({"level": 7}));
                Ok(json!({"level": 8}))
            })
            .build();
        let d = Dispatcher::new(Arc::new(table), compat);

        let out = d
            .handle_text(
                r#"{"jsonrpc":"2.0","id":1,"method":"set_level","params":7}"#,
                &PeerContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(parse(&out)["result"], json!(8));
    }

    #[test]
    fn test_str_param_aliases() {
        let call = IncomingCall {
            method: "m".into(),
            params: json!({"modelId": "abc"}),
            id: None,
            metadata: None,
            peer: PeerContext::default(),
        };
        assert_eq!(call.str_param("model_id", "modelId"), Some("abc"));
        assert!(call.is_notification());
    }
}
