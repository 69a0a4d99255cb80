//! Transport adapters.
//!
//! A [`Transport`] maps the abstract session operations onto one physical
//! protocol:
//!
//! | scheme         | adapter              | roles                          |
//! |----------------|----------------------|--------------------------------|
//! | `http`/`https` | [`HttpTransport`]    | Requester, Responder           |
//! | `ws`/`wss`     | [`DuplexTransport`]  | all four                       |
//! | `tcp`/`zmtp`   | [`BinaryTransport`]  | all four                       |
//!
//! Client roles get a [`ClientLink`]: a command queue into an I/O task and
//! an event queue out of it. Server roles bind a listener that feeds the
//! [`Dispatcher`] and the [`PeerRegistry`].

pub mod binary;
pub mod duplex;
pub mod http;

pub use binary::BinaryTransport;
pub use duplex::DuplexTransport;
pub use http::HttpTransport;

use crate::config::BusConfig;
use crate::dispatch::Dispatcher;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::registry::PeerRegistry;
use crate::security::SecurityProvider;
use crate::session::Role;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Instruction from a client session to its I/O task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// JSON-RPC text (single message or batch).
    Text(String),
    Subscribe(Bytes),
    Cancel(Bytes),
    Close,
}

/// Something the I/O task observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// JSON-RPC text from the peer.
    Text(String),
    Publication { topic: Bytes, payload: Bytes },
    /// One exchange failed but the link is still usable.
    Failed(String),
    /// The link is gone.
    Closed(String),
}

/// A live client connection.
pub struct ClientLink {
    commands: mpsc::Sender<LinkCommand>,
    events: mpsc::Receiver<LinkEvent>,
    task: Option<JoinHandle<()>>,
}

/// The I/O-task half of a [`ClientLink`].
pub struct LinkIo {
    pub commands: mpsc::Receiver<LinkCommand>,
    pub events: mpsc::Sender<LinkEvent>,
}

impl ClientLink {
    /// Create the queue pair shared by a link and its I/O task.
    pub fn pair() -> (mpsc::Sender<LinkCommand>, mpsc::Receiver<LinkEvent>, LinkIo) {
        let (cmd_tx, cmd_rx) = mpsc::channel(BusConfig::LINK_QUEUE);
        let (evt_tx, evt_rx) = mpsc::channel(BusConfig::LINK_QUEUE);
        (
            cmd_tx,
            evt_rx,
            LinkIo {
                commands: cmd_rx,
                events: evt_tx,
            },
        )
    }

    pub fn new(
        commands: mpsc::Sender<LinkCommand>,
        events: mpsc::Receiver<LinkEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            events,
            task: Some(task),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<LinkCommand> {
        self.commands.clone()
    }

    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    /// Ask the I/O task to close; it is aborted if it can't take the request.
    pub fn close(&mut self) {
        if self.commands.try_send(LinkCommand::Close).is_err() {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for ClientLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() && self.commands.try_send(LinkCommand::Close).is_err() {
                task.abort();
            }
        }
    }
}

/// Everything a server listener needs.
#[derive(Clone)]
pub struct ServerContext {
    pub role: Role,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<PeerRegistry>,
    pub security: Arc<dyn SecurityProvider>,
    pub shutdown: watch::Receiver<bool>,
}

/// A bound server listener.
pub struct ServerBinding {
    local_addr: SocketAddr,
    task: Option<JoinHandle<()>>,
}

impl ServerBinding {
    pub fn new(local_addr: SocketAddr, task: JoinHandle<()>) -> Self {
        Self {
            local_addr,
            task: Some(task),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the listener task if it is still running.
    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Stopping listener on {}", self.local_addr);
            task.abort();
        }
    }
}

impl Drop for ServerBinding {
    fn drop(&mut self) {
        self.abort();
    }
}

/// One physical protocol.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Capability matrix entry.
    fn supports(&self, role: Role) -> bool;

    /// Open a client link (Requester or Subscriber).
    async fn connect(
        &self,
        endpoint: &Endpoint,
        role: Role,
        security: Arc<dyn SecurityProvider>,
    ) -> Result<ClientLink>;

    /// Bind a listener (Responder or Publisher).
    async fn bind(&self, endpoint: &Endpoint, ctx: ServerContext) -> Result<ServerBinding>;
}

/// Wait until `shutdown` flips to `true` (or its sender is gone).
pub(crate) async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
