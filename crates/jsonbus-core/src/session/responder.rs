//! Responder role: serves requests from any number of peers.

use super::server::ServerCore;
use super::state::{Role, SessionState};
use crate::config::BusOptions;
use crate::dispatch::{PeerContext, RequestHandler};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;

/// Server handle that answers JSON-RPC calls.
///
/// Every peer connection gets its own correlation scope; the handler is
/// shared and may run for several peers at once.
pub struct Responder {
    core: ServerCore,
}

impl Responder {
    pub(crate) async fn start(
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        options: &BusOptions,
        handler: Arc<dyn RequestHandler>,
        session_id: String,
    ) -> Result<Self> {
        let core = ServerCore::bind(
            endpoint,
            Role::Responder,
            transport,
            options,
            handler,
            session_id,
        )
        .await?;
        Ok(Self { core })
    }

    pub fn uri(&self) -> &str {
        self.core.endpoint.uri()
    }

    pub fn role(&self) -> Role {
        Role::Responder
    }

    pub fn state(&self) -> SessionState {
        self.core.state.get()
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    /// Replace the request handler. Calls already running finish on the
    /// old one.
    pub fn on_request(&self, handler: Arc<dyn RequestHandler>) {
        self.core.dispatcher.set_handler(handler);
    }

    /// Peers currently connected (always empty for HTTP).
    pub fn peers(&self) -> Vec<PeerContext> {
        self.core.registry.peers()
    }

    pub fn close(&self) {
        self.core.close();
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.core.close();
    }
}
