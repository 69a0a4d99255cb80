//! Listener plumbing shared by the server roles.

use super::state::{Role, SessionState, StateCell};
use crate::config::BusOptions;
use crate::dispatch::{Dispatcher, RequestHandler};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::registry::PeerRegistry;
use crate::transport::{ServerBinding, ServerContext, Transport};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;

/// A bound listener with its peer registry and dispatcher.
pub(crate) struct ServerCore {
    pub endpoint: Endpoint,
    pub role: Role,
    pub session_id: String,
    pub state: StateCell,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<PeerRegistry>,
    local_addr: SocketAddr,
    binding: Mutex<Option<ServerBinding>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl ServerCore {
    pub async fn bind(
        endpoint: Endpoint,
        role: Role,
        transport: Arc<dyn Transport>,
        options: &BusOptions,
        handler: Arc<dyn RequestHandler>,
        session_id: String,
    ) -> Result<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new(handler, options.compat.clone()));
        let registry = Arc::new(PeerRegistry::new(options.max_connections));

        let ctx = ServerContext {
            role,
            dispatcher: dispatcher.clone(),
            registry: registry.clone(),
            security: options.security.clone(),
            shutdown: shutdown_rx,
        };
        let binding = transport.bind(&endpoint, ctx).await?;
        let local_addr = binding.local_addr();
        info!("{} [{}] bound to {}", role, session_id, local_addr);

        Ok(Self {
            endpoint,
            role,
            session_id,
            state: StateCell::new(SessionState::Ready),
            dispatcher,
            registry,
            local_addr,
            binding: Mutex::new(Some(binding)),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop listening and drop every peer. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        self.registry.clear();
        let binding = self
            .binding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(binding);
        self.state.set(SessionState::Closed);
        info!("{} [{}] on {} closed", self.role, self.session_id, self.local_addr);
        true
    }
}
