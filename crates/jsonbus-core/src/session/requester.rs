//! Requester role: sends requests and awaits one reply at a time.

use super::client::{ensure_off_runtime, retry_policy, spawn_driver, wait_blocking, ClientCore, LinkHandler};
use super::state::{Role, SessionState};
use crate::config::BusOptions;
use crate::correlation::{Correlator, ReplyFuture};
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::transport::{LinkCommand, LinkEvent, Transport};
use jsonbus_proto::codec;
use jsonbus_proto::{CompatRules, Id, Message, Notification, Reply, Request};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

/// Client handle for request/reply exchanges.
///
/// At most one request is in flight per connection; a second
/// [`send`](Self::send) before the first reply fails with
/// [`BusError::RequestPending`].
pub struct Requester {
    core: Arc<ClientCore>,
    correlator: Arc<Correlator>,
    compat: CompatRules,
    default_timeout: Duration,
    next_id: AtomicI64,
    runtime: Handle,
}

impl Requester {
    pub(crate) fn start(
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        options: &BusOptions,
        runtime: Handle,
        session_id: String,
    ) -> Self {
        let retry = retry_policy(&endpoint, &options.retry);
        let default_timeout = endpoint.options().timeout.unwrap_or(options.request_timeout);
        let core = Arc::new(ClientCore::new(endpoint, Role::Requester, session_id));
        let correlator = Arc::new(Correlator::new());

        let router = Arc::new(ReplyRouter {
            correlator: correlator.clone(),
        });
        spawn_driver(&runtime, core.clone(), transport, options.security.clone(), retry, router);

        Self {
            core,
            correlator,
            compat: options.compat.clone(),
            default_timeout,
            next_id: AtomicI64::new(1),
            runtime,
        }
    }

    pub fn uri(&self) -> &str {
        self.core.endpoint.uri()
    }

    pub fn role(&self) -> Role {
        Role::Requester
    }

    pub fn state(&self) -> SessionState {
        self.core.state.get()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.core.state.subscribe()
    }

    /// Wait until the connection is up.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        self.core.state.wait_ready(timeout).await
    }

    /// Reply timeout used by [`call`](Self::call).
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Allocate the next request id.
    pub fn next_id(&self) -> Id {
        Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Write `request` and return a future for its reply.
    ///
    /// Never waits: fails with `TransportNotReady` when the connection is
    /// not `Ready` and with `RequestPending` while another reply is due.
    pub fn send(&self, request: Request) -> Result<ReplyFuture> {
        self.core.state.ensure_ready()?;
        let future = self.correlator.register(request.id().clone())?;
        let text = codec::encode(&Message::Request(request));
        // On failure the future is dropped here, which frees the slot
        self.core.try_send(LinkCommand::Text(text))?;
        Ok(future)
    }

    /// Fire-and-forget.
    pub fn notify(&self, notification: Notification) -> Result<()> {
        let text = codec::encode(&Message::Notification(notification));
        self.core.try_send(LinkCommand::Text(text))
    }

    /// Build a request with a fresh id and send it.
    pub fn request(&self, method: &str, params: Value) -> Result<ReplyFuture> {
        let params = self.compat.outbound_params(method, params);
        self.send(Request::new(self.next_id(), method).with_params(params))
    }

    /// Call `method` and return its result.
    ///
    /// A peer error object becomes [`BusError::Application`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let reply = self
            .request(method, params)?
            .with_timeout(self.default_timeout)
            .await?;
        match reply.into_result() {
            Ok(result) => Ok(self.compat.inbound_result(method, result)),
            Err(error) => Err(BusError::Application {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
        }
    }

    pub async fn send_with_timeout(&self, request: Request, timeout: Duration) -> Result<Reply> {
        self.send(request)?.with_timeout(timeout).await
    }

    /// Blocking variant of [`send_with_timeout`](Self::send_with_timeout).
    ///
    /// The wait happens on the calling thread, which must not belong to a
    /// tokio runtime; from async code use the async variant instead.
    pub fn send_and_wait(&self, request: Request, timeout: Duration) -> Result<Reply> {
        ensure_off_runtime()?;
        let future = self.send(request)?;
        wait_blocking(&self.runtime, timeout, future.with_timeout(timeout))
    }

    /// Drop the current connection and pending request, then reconnect.
    pub fn reopen(&self) -> Result<()> {
        if self.core.is_closed() {
            return Err(BusError::Closed);
        }
        self.correlator.fail(BusError::transport("session reopened"));
        self.core.request_reopen();
        Ok(())
    }

    /// Close the session. Further calls are no-ops.
    pub fn close(&self) {
        if self.core.close() {
            self.correlator.fail(BusError::Closed);
            debug!("Requester {} closed", self.core.session_id);
        }
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        self.close();
    }
}

/// Routes replies from the link into the correlator.
struct ReplyRouter {
    correlator: Arc<Correlator>,
}

impl ReplyRouter {
    fn route(&self, message: Message) {
        match message {
            Message::Reply(reply) => {
                let id = reply.id().cloned();
                let outcome = match reply.error() {
                    // The peer could not read our request at all
                    Some(error) if error.is_protocol_parse() => Err(BusError::ProtocolParse {
                        code: error.code,
                        message: error.message.clone(),
                    }),
                    _ => Ok(reply),
                };
                self.correlator.resolve(id.as_ref(), outcome);
            }
            Message::ParseError(err) => {
                let id = err.id().cloned();
                let outcome = Err(BusError::ProtocolParse {
                    code: err.code(),
                    message: err.message().to_string(),
                });
                self.correlator.resolve(id.as_ref(), outcome);
            }
            other => debug!("Requester ignores inbound {:?}", other.kind()),
        }
    }
}

impl LinkHandler for ReplyRouter {
    fn on_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Text(text) => {
                for message in codec::decode(&text) {
                    self.route(message);
                }
            }
            LinkEvent::Failed(reason) => self.correlator.fail(BusError::transport(reason)),
            LinkEvent::Publication { .. } => debug!("Requester ignores publications"),
            LinkEvent::Closed(_) => {}
        }
    }

    fn on_disconnected(&self, reason: &str) {
        self.correlator
            .fail(BusError::transport(format!("connection lost: {}", reason)));
    }
}
