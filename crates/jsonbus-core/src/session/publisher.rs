//! Publisher role: fans messages out to matching subscribers.

use super::server::ServerCore;
use super::state::{Role, SessionState};
use crate::config::BusOptions;
use crate::dispatch::MethodTable;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::transport::Transport;
use bytes::Bytes;
use jsonbus_proto::{codec, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::trace;

/// Server handle for topic publications.
pub struct Publisher {
    core: ServerCore,
}

impl Publisher {
    pub(crate) async fn start(
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        options: &BusOptions,
        session_id: String,
    ) -> Result<Self> {
        let core = ServerCore::bind(
            endpoint,
            Role::Publisher,
            transport,
            options,
            Arc::new(MethodTable::empty()),
            session_id,
        )
        .await?;
        Ok(Self { core })
    }

    pub fn uri(&self) -> &str {
        self.core.endpoint.uri()
    }

    pub fn role(&self) -> Role {
        Role::Publisher
    }

    pub fn state(&self) -> SessionState {
        self.core.state.get()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    /// Send `message` to every peer subscribed to a prefix of `topic`.
    ///
    /// Returns the number of peers it was queued for; zero is not an error.
    pub fn publish(&self, topic: impl AsRef<[u8]>, message: &Message) -> Result<usize> {
        self.core.state.ensure_ready()?;
        let topic = topic.as_ref();
        let payload = Bytes::from(codec::encode(message));
        let delivered = self.core.registry.broadcast(topic, payload);
        trace!("Published on {:?} to {} peers", topic, delivered);
        Ok(delivered)
    }

    /// Connected peers, subscribed or not.
    pub fn peer_count(&self) -> usize {
        self.core.registry.len()
    }

    /// Peers whose subscriptions match `topic`.
    pub fn subscriber_count(&self, topic: impl AsRef<[u8]>) -> usize {
        self.core.registry.subscriber_count(topic.as_ref())
    }

    pub fn close(&self) {
        self.core.close();
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.core.close();
    }
}

