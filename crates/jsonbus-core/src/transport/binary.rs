//! Binary transport over ZMTP.
//!
//! A [`WireEngine`] does the protocol work; this module owns the sockets.
//! Requesters speak REQ and frame each text as `[empty, json]`. Responders
//! speak REP and echo the envelope back with the reply. Publishers send
//! `[topic, json]` to every peer whose subscriptions match.
//!
//! REP answers a notification with an empty body so the REQ/REP lockstep
//! holds; requesters drop empty replies.

use super::{ClientLink, LinkCommand, LinkEvent, LinkIo, ServerBinding, ServerContext, Transport};
use crate::config::BusConfig;
use crate::dispatch::PeerContext;
use crate::endpoint::{Endpoint, SessionOptions};
use crate::error::{BusError, Result};
use crate::registry::PeerFrame;
use crate::security::{BoxedStream, ProviderAuthenticator, SecurityProvider};
use crate::session::Role;
use async_trait::async_trait;
use bytes::Bytes;
use jsonbus_proto::wire::{EngineConfig, PeerInfo, SocketType, WireConfig, WireEngine, WireEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// ZMTP adapter (`tcp`, `zmtp`).
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryTransport;

impl BinaryTransport {
    pub fn new() -> Self {
        Self
    }
}

fn socket_type_for(role: Role) -> SocketType {
    match role {
        Role::Requester => SocketType::Req,
        Role::Responder => SocketType::Rep,
        Role::Publisher => SocketType::Pub,
        Role::Subscriber => SocketType::Sub,
    }
}

#[async_trait]
impl Transport for BinaryTransport {
    fn name(&self) -> &'static str {
        "zmtp"
    }

    fn supports(&self, _role: Role) -> bool {
        true
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        role: Role,
        security: Arc<dyn SecurityProvider>,
    ) -> Result<ClientLink> {
        let socket_type = socket_type_for(role);

        let tcp = tokio::time::timeout(
            BusConfig::CONNECT_TIMEOUT,
            TcpStream::connect(endpoint.authority()),
        )
        .await
        .map_err(|_| BusError::Timeout(BusConfig::CONNECT_TIMEOUT))??;
        tcp.set_nodelay(true)?;
        let stream = security.secure_client(tcp, endpoint).await?;

        let options = endpoint.options();
        let mut config = EngineConfig::new(socket_type).with_max_frame_size(WireConfig::MAX_FRAME_SIZE);
        if let Some(identity) = &options.identity {
            config = config.with_identity(Bytes::from(identity.clone().into_bytes()));
        }
        if let Some((user, password)) = options.credentials() {
            config = config.with_credentials(user, password);
        }

        let mut link = WireLink::new(stream, WireEngine::new(config));
        let (peer, pending) = tokio::time::timeout(BusConfig::HANDSHAKE_TIMEOUT, link.handshake())
            .await
            .map_err(|_| BusError::Handshake {
                message: format!("no handshake from {} within {:?}", endpoint, BusConfig::HANDSHAKE_TIMEOUT),
                source: None,
            })??;
        debug!(
            "ZMTP {} connected to {} peer at {}",
            socket_type.as_str(),
            peer.socket_type.as_str(),
            endpoint
        );

        let (commands, events, io) = ClientLink::pair();
        let task = tokio::spawn(run_client(link, role, endpoint.to_string(), pending, io));
        Ok(ClientLink::new(commands, events, task))
    }

    async fn bind(&self, endpoint: &Endpoint, ctx: ServerContext) -> Result<ServerBinding> {
        let socket_type = socket_type_for(ctx.role);

        let listener = TcpListener::bind(endpoint.authority()).await?;
        let local_addr = listener.local_addr()?;
        info!("ZMTP {} listening on tcp://{}", socket_type.as_str(), local_addr);

        let options = Arc::new(endpoint.options().clone());
        let task = tokio::spawn(accept_loop(listener, socket_type, options, ctx));
        Ok(ServerBinding::new(local_addr, task))
    }
}

// ============================================================================
// Socket plumbing
// ============================================================================

/// A socket driven by a wire engine.
struct WireLink {
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
    engine: WireEngine,
    buf: Vec<u8>,
}

impl WireLink {
    fn new(stream: BoxedStream, engine: WireEngine) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            engine,
            buf: vec![0; BusConfig::READ_BUFFER],
        }
    }

    /// Write out everything the engine has queued.
    async fn flush(&mut self) -> Result<()> {
        while let Some(bytes) = self.engine.poll_transmit() {
            self.writer.write_all(&bytes).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Feed `n` freshly read bytes from `buf`.
    async fn receive(&mut self, n: usize) -> Result<Vec<WireEvent>> {
        if n == 0 {
            return Err(BusError::transport("connection closed by peer"));
        }
        let fed = self.engine.feed(&self.buf[..n]);
        // A failed engine may still have an ERROR command for the peer
        let flushed = self.flush().await;
        let events = fed?;
        flushed?;
        Ok(events)
    }

    /// Run the greeting and handshake; returns the peer and any events
    /// that arrived right behind it.
    async fn handshake(&mut self) -> Result<(PeerInfo, Vec<WireEvent>)> {
        self.flush().await?;
        loop {
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Err(BusError::Handshake {
                    message: "peer closed the connection during the handshake".to_string(),
                    source: None,
                });
            }

            let mut peer = None;
            let mut rest = Vec::new();
            for event in self.receive(n).await? {
                match event {
                    WireEvent::HandshakeComplete(info) if peer.is_none() => peer = Some(info),
                    other => rest.push(other),
                }
            }
            if let Some(peer) = peer {
                return Ok((peer, rest));
            }
        }
    }
}

// ============================================================================
// Client side
// ============================================================================

async fn run_client(
    mut link: WireLink,
    role: Role,
    label: String,
    pending: Vec<WireEvent>,
    mut io: LinkIo,
) {
    // Frames that arrived in the same read as the handshake go first.
    if !forward_events(role, pending, &io.events).await {
        debug!("ZMTP link to {} dropped before it was used", label);
        return;
    }
    let reason = match client_loop(&mut link, role, &mut io).await {
        Ok(()) => "closed locally".to_string(),
        Err(e) => e.to_string(),
    };
    debug!("ZMTP link to {} ended: {}", label, reason);
    let _ = io.events.send(LinkEvent::Closed(reason)).await;
}

async fn client_loop(link: &mut WireLink, role: Role, io: &mut LinkIo) -> Result<()> {
    loop {
        tokio::select! {
            command = io.commands.recv() => {
                match command {
                    Some(LinkCommand::Text(text)) if role == Role::Requester => {
                        link.engine.send_message(&[Bytes::new(), Bytes::from(text)])?;
                    }
                    Some(LinkCommand::Text(_)) => {
                        debug!("{} link does not send JSON-RPC text", role);
                        continue;
                    }
                    Some(LinkCommand::Subscribe(topic)) => link.engine.subscribe(&topic)?,
                    Some(LinkCommand::Cancel(topic)) => link.engine.cancel(&topic)?,
                    Some(LinkCommand::Close) | None => {
                        link.engine.close();
                        return Ok(());
                    }
                }
                link.flush().await?;
            }
            read = link.reader.read(&mut link.buf) => {
                let n = read?;
                let events = link.receive(n).await?;
                if !forward_events(role, events, &io.events).await {
                    return Ok(());
                }
            }
        }
    }
}

/// Hand engine events to the session. Returns `false` once nobody listens.
async fn forward_events(
    role: Role,
    events: Vec<WireEvent>,
    sink: &mpsc::Sender<LinkEvent>,
) -> bool {
    for event in events {
        let Some(event) = client_event(role, event) else {
            continue;
        };
        if sink.send(event).await.is_err() {
            return false;
        }
    }
    true
}

/// Translate an engine event for the session.
fn client_event(role: Role, event: WireEvent) -> Option<LinkEvent> {
    let WireEvent::Message(parts) = event else {
        return None;
    };

    match role {
        Role::Subscriber => {
            let (topic, payload) = match parts.as_slice() {
                [payload] => (Bytes::new(), payload.clone()),
                [topic, .., payload] => (topic.clone(), payload.clone()),
                [] => return None,
            };
            Some(LinkEvent::Publication { topic, payload })
        }
        _ => {
            let body = parts.last()?;
            if body.is_empty() {
                return None;
            }
            match String::from_utf8(body.to_vec()) {
                Ok(text) => Some(LinkEvent::Text(text)),
                Err(_) => {
                    warn!("Discarding non-UTF-8 reply ({} bytes)", body.len());
                    None
                }
            }
        }
    }
}

// ============================================================================
// Server side
// ============================================================================

async fn accept_loop(
    listener: TcpListener,
    socket_type: SocketType,
    options: Arc<SessionOptions>,
    ctx: ServerContext,
) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("ZMTP {} listener shutting down", socket_type.as_str());
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let ctx = ctx.clone();
                    let options = options.clone();
                    tokio::spawn(async move {
                        debug!("ZMTP connection from {}", peer_addr);
                        if let Err(e) = serve_connection(stream, peer_addr, socket_type, &options, &ctx).await {
                            debug!("ZMTP connection {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => error!("ZMTP accept error: {}", e),
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    socket_type: SocketType,
    options: &SessionOptions,
    ctx: &ServerContext,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let stream = ctx.security.secure_server(stream, options).await?;

    let mut config = EngineConfig::new(socket_type).with_max_frame_size(WireConfig::MAX_FRAME_SIZE);
    if ctx.security.requires_authentication() {
        config = config.with_authenticator(Arc::new(ProviderAuthenticator(ctx.security.clone())));
    }

    let mut link = WireLink::new(stream, WireEngine::new(config));
    let (info, pending) = tokio::time::timeout(BusConfig::HANDSHAKE_TIMEOUT, link.handshake())
        .await
        .map_err(|_| BusError::Handshake {
            message: format!("no handshake from {} within {:?}", addr, BusConfig::HANDSHAKE_TIMEOUT),
            source: None,
        })??;

    let (peer, outbound) = ctx
        .registry
        .register(Some(addr), info.username.clone(), BusConfig::PEER_QUEUE)?;
    debug!(
        "Peer {} ({} {}) ready",
        peer.id,
        info.socket_type.as_str(),
        addr
    );

    let result = peer_loop(&mut link, &peer, outbound, pending, ctx).await;
    ctx.registry.remove(peer.id);
    result
}

async fn peer_loop(
    link: &mut WireLink,
    peer: &PeerContext,
    mut outbound: mpsc::Receiver<PeerFrame>,
    pending: Vec<WireEvent>,
    ctx: &ServerContext,
) -> Result<()> {
    for event in pending {
        server_event(link, peer, event, ctx).await?;
    }
    link.flush().await?;

    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            frame = outbound.recv() => {
                let Some(PeerFrame::Publication { topic, payload }) = frame else {
                    // Dropped by the registry
                    return Ok(());
                };
                link.engine.send_message(&[topic, payload])?;
                link.flush().await?;
            }
            read = link.reader.read(&mut link.buf) => {
                let n = read?;
                for event in link.receive(n).await? {
                    server_event(link, peer, event, ctx).await?;
                }
                link.flush().await?;
            }
        }
    }
}

async fn server_event(
    link: &mut WireLink,
    peer: &PeerContext,
    event: WireEvent,
    ctx: &ServerContext,
) -> Result<()> {
    match event {
        WireEvent::Message(parts) if ctx.role == Role::Responder => {
            // Everything up to the empty delimiter is the routing envelope
            let split = parts.iter().position(|p| p.is_empty()).map_or(0, |i| i + 1);
            let (envelope, body) = parts.split_at(split);
            let text = body
                .last()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();

            let reply = ctx.dispatcher.handle_text(&text, peer).await.unwrap_or_default();
            let mut out = envelope.to_vec();
            out.push(Bytes::from(reply));
            link.engine.send_message(&out)?;
        }
        WireEvent::Message(parts) => {
            debug!("{} ignores a {}-part message from peer {}", ctx.role, parts.len(), peer.id);
        }
        WireEvent::Subscribed(topic) => ctx.registry.subscribe(peer.id, topic),
        WireEvent::Cancelled(topic) => ctx.registry.cancel(peer.id, &topic),
        WireEvent::HandshakeComplete(_) => {}
    }
    Ok(())
}
