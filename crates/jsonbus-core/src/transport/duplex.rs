//! Full-duplex transport over WebSocket.
//!
//! Text frames carry JSON-RPC. Binary frames carry the pub/sub envelope:
//!
//! ```text
//! 0x01 topic                          subscribe
//! 0x00 topic                          cancel
//! 0x02 u32be(topic_len) topic json    publication
//! ```

use super::{shutdown_signal, ClientLink, LinkCommand, LinkEvent, LinkIo, ServerBinding, ServerContext, Transport};
use crate::config::BusConfig;
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::registry::PeerFrame;
use crate::security::{basic_auth_header, check_basic_auth, parse_basic_auth, SecurityProvider};
use crate::session::Role;
use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const TAG_CANCEL: u8 = 0x00;
const TAG_SUBSCRIBE: u8 = 0x01;
const TAG_PUBLICATION: u8 = 0x02;

/// A decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryFrame {
    Subscribe(Bytes),
    Cancel(Bytes),
    Publication { topic: Bytes, payload: Bytes },
}

impl BinaryFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            BinaryFrame::Subscribe(topic) => tagged(TAG_SUBSCRIBE, topic),
            BinaryFrame::Cancel(topic) => tagged(TAG_CANCEL, topic),
            BinaryFrame::Publication { topic, payload } => {
                let mut buf = BytesMut::with_capacity(5 + topic.len() + payload.len());
                buf.put_u8(TAG_PUBLICATION);
                buf.put_u32(topic.len() as u32);
                buf.put_slice(topic);
                buf.put_slice(payload);
                buf.to_vec()
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let Some((&tag, rest)) = data.split_first() else {
            return Err(BusError::transport("empty binary frame"));
        };
        match tag {
            TAG_SUBSCRIBE => Ok(BinaryFrame::Subscribe(Bytes::copy_from_slice(rest))),
            TAG_CANCEL => Ok(BinaryFrame::Cancel(Bytes::copy_from_slice(rest))),
            TAG_PUBLICATION => {
                let mut body = rest;
                if body.remaining() < 4 {
                    return Err(BusError::transport("truncated publication header"));
                }
                let topic_len = body.get_u32() as usize;
                if body.remaining() < topic_len {
                    return Err(BusError::transport("truncated publication topic"));
                }
                let topic = Bytes::copy_from_slice(&body[..topic_len]);
                let payload = Bytes::copy_from_slice(&body[topic_len..]);
                Ok(BinaryFrame::Publication { topic, payload })
            }
            other => Err(BusError::transport(format!("unknown binary frame tag {:#04x}", other))),
        }
    }
}

fn tagged(tag: u8, topic: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + topic.len());
    out.push(tag);
    out.extend_from_slice(topic);
    out
}

/// WebSocket adapter (`ws`, `wss`).
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplexTransport;

impl DuplexTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn supports(&self, _role: Role) -> bool {
        true
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        _role: Role,
        _security: Arc<dyn SecurityProvider>,
    ) -> Result<ClientLink> {
        let url = endpoint.client_url("ws", "wss");
        let mut request = url.as_str().into_client_request()?;
        if let Some((user, password)) = endpoint.options().credentials() {
            let value = HeaderValue::from_str(&basic_auth_header(&user, &password)).map_err(|e| {
                BusError::Security {
                    message: format!("unusable credentials: {}", e),
                }
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) =
            tokio::time::timeout(BusConfig::CONNECT_TIMEOUT, connect_async(request))
                .await
                .map_err(|_| BusError::Timeout(BusConfig::CONNECT_TIMEOUT))??;
        debug!("WebSocket connected to {}", url);

        let (commands, events, io) = ClientLink::pair();
        let task = tokio::spawn(run_client(stream, url, io));
        Ok(ClientLink::new(commands, events, task))
    }

    async fn bind(&self, endpoint: &Endpoint, ctx: ServerContext) -> Result<ServerBinding> {
        if endpoint.tls_required() {
            return Err(BusError::Security {
                message: "the WebSocket listener does not terminate TLS".to_string(),
            });
        }
        if endpoint.path() == BusConfig::HEALTH_PATH {
            return Err(BusError::invalid_uri(
                endpoint.uri(),
                "path is reserved for the health check",
            ));
        }

        let shutdown = ctx.shutdown.clone();
        let app = Router::new()
            .route(BusConfig::HEALTH_PATH, get(handle_health))
            .route(endpoint.path(), get(handle_upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::new(ctx));

        let listener = TcpListener::bind(endpoint.authority()).await?;
        let local_addr = listener.local_addr()?;
        info!("WebSocket listener on ws://{}{}", local_addr, endpoint.path());

        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal(shutdown))
            .await;
            if let Err(e) = served {
                error!("WebSocket listener on {} failed: {}", local_addr, e);
            }
        });

        Ok(ServerBinding::new(local_addr, task))
    }
}

// ============================================================================
// Client side
// ============================================================================

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run_client(stream: ClientStream, url: String, mut io: LinkIo) {
    let (mut sink, mut source) = stream.split();

    let reason = loop {
        tokio::select! {
            command = io.commands.recv() => {
                let frame = match command {
                    Some(LinkCommand::Text(text)) => WsMessage::Text(text),
                    Some(LinkCommand::Subscribe(topic)) => {
                        WsMessage::Binary(BinaryFrame::Subscribe(topic).encode())
                    }
                    Some(LinkCommand::Cancel(topic)) => {
                        WsMessage::Binary(BinaryFrame::Cancel(topic).encode())
                    }
                    Some(LinkCommand::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break "closed locally".to_string();
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    break e.to_string();
                }
            }
            incoming = source.next() => {
                let event = match incoming {
                    Some(Ok(WsMessage::Text(text))) => LinkEvent::Text(text),
                    Some(Ok(WsMessage::Binary(data))) => match BinaryFrame::decode(&data) {
                        Ok(BinaryFrame::Publication { topic, payload }) => {
                            LinkEvent::Publication { topic, payload }
                        }
                        Ok(other) => {
                            debug!("Ignoring {:?} from {}", other, url);
                            continue;
                        }
                        Err(e) => {
                            warn!("Bad binary frame from {}: {}", url, e);
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break "closed by peer".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                };
                if io.events.send(event).await.is_err() {
                    break "session dropped".to_string();
                }
            }
        }
    };

    debug!("WebSocket link to {} ended: {}", url, reason);
    let _ = io.events.send(LinkEvent::Closed(reason)).await;
}

// ============================================================================
// Server side
// ============================================================================

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_upgrade(
    State(ctx): State<Arc<ServerContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !check_basic_auth(ctx.security.as_ref(), auth) {
        warn!("Rejecting unauthenticated WebSocket peer {}", addr);
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"jsonbus\"")],
        )
            .into_response();
    }
    let user = auth.and_then(parse_basic_auth).map(|(user, _)| user);

    ws.on_upgrade(move |socket| serve_peer(socket, ctx, addr, user))
}

async fn serve_peer(socket: WebSocket, ctx: Arc<ServerContext>, addr: SocketAddr, user: Option<String>) {
    let (peer, mut outbound) = match ctx.registry.register(Some(addr), user, BusConfig::PEER_QUEUE) {
        Ok(registered) => registered,
        Err(e) => {
            warn!("Refusing WebSocket peer {}: {}", addr, e);
            return;
        }
    };
    debug!("WebSocket peer {} connected from {}", peer.id, addr);

    let (mut sink, mut source) = socket.split();
    let mut shutdown = ctx.shutdown.clone();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            frame = outbound.recv() => {
                let Some(PeerFrame::Publication { topic, payload }) = frame else {
                    // Dropped by the registry
                    break;
                };
                let data = BinaryFrame::Publication { topic, payload }.encode();
                if sink.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if ctx.role != Role::Responder {
                        debug!("{} ignores JSON-RPC text from peer {}", ctx.role, peer.id);
                        continue;
                    }
                    if let Some(reply) = ctx.dispatcher.handle_text(&text, &peer).await {
                        if sink.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => match BinaryFrame::decode(&data) {
                    Ok(BinaryFrame::Subscribe(topic)) if ctx.role == Role::Publisher => {
                        ctx.registry.subscribe(peer.id, topic);
                    }
                    Ok(BinaryFrame::Cancel(topic)) if ctx.role == Role::Publisher => {
                        ctx.registry.cancel(peer.id, &topic);
                    }
                    Ok(other) => debug!("{} ignores {:?} from peer {}", ctx.role, other, peer.id),
                    Err(e) => warn!("Bad binary frame from peer {}: {}", peer.id, e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket peer {} failed: {}", peer.id, e);
                    break;
                }
            }
        }
    }

    ctx.registry.remove(peer.id);
    debug!("WebSocket peer {} disconnected", peer.id);
}
