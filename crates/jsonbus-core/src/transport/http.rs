//! Plain request/response transport over HTTP.
//!
//! Each JSON-RPC text is one `POST {path}`; the response body carries the
//! reply, and `204 No Content` means "nothing to say" (notifications).
//! The responder also answers `GET /health`.

use super::{shutdown_signal, ClientLink, LinkCommand, LinkEvent, LinkIo, ServerBinding, ServerContext, Transport};
use crate::config::BusConfig;
use crate::dispatch::{Dispatcher, PeerContext};
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::security::{basic_auth_header, check_basic_auth, parse_basic_auth, SecurityProvider};
use crate::session::Role;
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// HTTP adapter (`http`, `https`).
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransport;

impl HttpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports(&self, role: Role) -> bool {
        matches!(role, Role::Requester | Role::Responder)
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        _role: Role,
        _security: Arc<dyn SecurityProvider>,
    ) -> Result<ClientLink> {
        let mut builder = reqwest::Client::builder().connect_timeout(BusConfig::CONNECT_TIMEOUT);
        if let Some(timeout) = endpoint.options().timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        // HTTP is connectionless, but a session only turns Ready when
        // something is listening.
        let reachable = tokio::time::timeout(
            BusConfig::CONNECT_TIMEOUT,
            TcpStream::connect(endpoint.authority()),
        )
        .await
        .map_err(|_| BusError::Timeout(BusConfig::CONNECT_TIMEOUT))??;
        drop(reachable);

        let url = endpoint.client_url("http", "https");
        let auth = endpoint
            .options()
            .credentials()
            .map(|(user, password)| basic_auth_header(&user, &password));

        let (commands, events, io) = ClientLink::pair();
        let task = tokio::spawn(run_client(client, url, auth, io));
        Ok(ClientLink::new(commands, events, task))
    }

    async fn bind(&self, endpoint: &Endpoint, ctx: ServerContext) -> Result<ServerBinding> {
        if endpoint.tls_required() {
            return Err(BusError::Security {
                message: "the HTTP responder does not terminate TLS".to_string(),
            });
        }
        if endpoint.path() == BusConfig::HEALTH_PATH {
            return Err(BusError::invalid_uri(
                endpoint.uri(),
                "path is reserved for the health check",
            ));
        }

        let state = Arc::new(HttpState {
            dispatcher: ctx.dispatcher.clone(),
            security: ctx.security.clone(),
            next_peer: AtomicU64::new(1),
        });

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route(BusConfig::HEALTH_PATH, get(handle_health))
            .route(endpoint.path(), post(handle_rpc))
            .layer(ConcurrencyLimitLayer::new(BusConfig::MAX_CONCURRENT_HTTP))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(state);

        let listener = TcpListener::bind(endpoint.authority()).await?;
        let local_addr = listener.local_addr()?;
        info!("HTTP responder listening on {}{}", local_addr, endpoint.path());

        let shutdown = ctx.shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal(shutdown))
            .await;
            if let Err(e) = served {
                error!("HTTP responder on {} failed: {}", local_addr, e);
            }
        });

        Ok(ServerBinding::new(local_addr, task))
    }
}

// ============================================================================
// Client side
// ============================================================================

async fn run_client(client: reqwest::Client, url: String, auth: Option<String>, mut io: LinkIo) {
    while let Some(command) = io.commands.recv().await {
        match command {
            LinkCommand::Text(body) => {
                let event = match post_text(&client, &url, auth.as_deref(), body).await {
                    Ok(Some(text)) => LinkEvent::Text(text),
                    Ok(None) => continue,
                    Err(PostError::Unreachable(e)) => {
                        warn!("{} is unreachable: {}", url, e);
                        let _ = io.events.send(LinkEvent::Closed(e.to_string())).await;
                        break;
                    }
                    Err(PostError::Failed(e)) => {
                        warn!("POST {} failed: {}", url, e);
                        LinkEvent::Failed(e.to_string())
                    }
                };
                if io.events.send(event).await.is_err() {
                    break;
                }
            }
            LinkCommand::Subscribe(_) | LinkCommand::Cancel(_) => {
                debug!("HTTP link ignores subscription commands");
            }
            LinkCommand::Close => break,
        }
    }
    debug!("HTTP link to {} closed", url);
}

/// Why a POST produced no reply.
enum PostError {
    /// The connection itself failed; the link is gone.
    Unreachable(reqwest::Error),
    /// This exchange failed; later ones may still succeed.
    Failed(BusError),
}

impl From<BusError> for PostError {
    fn from(err: BusError) -> Self {
        PostError::Failed(err)
    }
}

impl From<reqwest::Error> for PostError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || (err.is_request() && !err.is_timeout()) {
            PostError::Unreachable(err)
        } else {
            PostError::Failed(err.into())
        }
    }
}

async fn post_text(
    client: &reqwest::Client,
    url: &str,
    auth: Option<&str>,
    body: String,
) -> std::result::Result<Option<String>, PostError> {
    let mut request = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body);
    if let Some(auth) = auth {
        request = request.header(reqwest::header::AUTHORIZATION, auth);
    }

    let response = request.send().await?;
    let status = response.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(BusError::Security {
            message: format!("{} rejected our credentials", url),
        }
        .into());
    }
    if !status.is_success() {
        return Err(BusError::transport(format!("{} answered HTTP {}", url, status)).into());
    }

    let text = response.text().await.map_err(|e| PostError::Failed(e.into()))?;
    if text.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

// ============================================================================
// Server side
// ============================================================================

struct HttpState {
    dispatcher: Arc<Dispatcher>,
    security: Arc<dyn SecurityProvider>,
    next_peer: AtomicU64,
}

/// Health check endpoint.
async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// JSON-RPC endpoint.
async fn handle_rpc(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !check_basic_auth(state.security.as_ref(), auth) {
        warn!("Rejecting unauthenticated HTTP request from {}", addr);
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"jsonbus\"")],
        )
            .into_response();
    }

    let peer = PeerContext {
        id: state.next_peer.fetch_add(1, Ordering::Relaxed),
        addr: Some(addr),
        user: auth.and_then(parse_basic_auth).map(|(user, _)| user),
    };

    match state.dispatcher.handle_text(&body, &peer).await {
        Some(reply) => ([(header::CONTENT_TYPE, "application/json")], reply).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{IncomingCall, MethodTable};
    use crate::registry::PeerRegistry;
    use crate::security::{PlainSecurity, StaticCredentials};
    use jsonbus_proto::CompatRules;
    use serde_json::Value;
    use tokio::sync::watch;

    fn context(security: Arc<dyn SecurityProvider>) -> (ServerContext, watch::Sender<bool>) {
        let table = MethodTable::builder()
            .method("add", |call: IncomingCall| async move {
                let (a, b): (i64, i64) = call.parse_params()?;
                Ok(json!(a + b))
            })
            .build();
        let (tx, rx) = watch::channel(false);
        let ctx = ServerContext {
            role: Role::Responder,
            dispatcher: Arc::new(Dispatcher::new(Arc::new(table), CompatRules::new())),
            registry: Arc::new(PeerRegistry::new(8)),
            security,
            shutdown: rx,
        };
        (ctx, tx)
    }

    #[tokio::test]
    async fn test_post_and_health() {
        let (ctx, _shutdown) = context(Arc::new(PlainSecurity));
        let endpoint = Endpoint::parse("http://127.0.0.1:0/rpc").unwrap();
        let binding = HttpTransport.bind(&endpoint, ctx).await.unwrap();
        let base = format!("http://{}", binding.local_addr());

        let client = reqwest::Client::new();
        let health: Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let reply: Value = client
            .post(format!("{}/rpc", base))
            .body(r#"{"jsonrpc":"2.0","id":1,"method":"add","params":[2,3]}"#)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reply["result"], json!(5));

        let status = client
            .post(format!("{}/rpc", base))
            .body(r#"{"jsonrpc":"2.0","method":"add","params":[2,3]}"#)
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_basic_auth_enforced() {
        let security = Arc::new(StaticCredentials::new().with_user("admin", "secret"));
        let (ctx, _shutdown) = context(security);
        let endpoint = Endpoint::parse("http://127.0.0.1:0/rpc").unwrap();
        let binding = HttpTransport.bind(&endpoint, ctx).await.unwrap();
        let url = format!("http://{}/rpc", binding.local_addr());
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"add","params":[1,1]}"#;

        let client = reqwest::Client::new();
        let denied = client.post(&url).body(body).send().await.unwrap();
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        let allowed = client
            .post(&url)
            .basic_auth("admin", Some("secret"))
            .body(body)
            .send()
            .await
            .unwrap();
        assert!(allowed.status().is_success());
    }

    #[tokio::test]
    async fn test_client_link_roundtrip() {
        let (ctx, _shutdown) = context(Arc::new(PlainSecurity));
        let endpoint = Endpoint::parse("http://127.0.0.1:0/rpc").unwrap();
        let binding = HttpTransport.bind(&endpoint, ctx).await.unwrap();

        let client_ep = Endpoint::parse(&format!("http://{}/rpc", binding.local_addr())).unwrap();
        let mut link = HttpTransport
            .connect(&client_ep, Role::Requester, Arc::new(PlainSecurity))
            .await
            .unwrap();
        link.sender()
            .send(LinkCommand::Text(
                r#"{"jsonrpc":"2.0","id":9,"method":"add","params":[4,5]}"#.to_string(),
            ))
            .await
            .unwrap();

        match link.next_event().await {
            Some(LinkEvent::Text(text)) => {
                let reply: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(reply["result"], json!(9));
            }
            other => panic!("unexpected event {:?}", other),
        }
        link.close();
    }

    #[tokio::test]
    async fn test_connect_requires_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Endpoint::parse(&format!("http://{}/rpc", addr)).unwrap();
        let result = HttpTransport
            .connect(&endpoint, Role::Requester, Arc::new(PlainSecurity))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_lost_server_closes_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoint = Endpoint::parse(&format!("http://{}/rpc", addr)).unwrap();
        let mut link = HttpTransport
            .connect(&endpoint, Role::Requester, Arc::new(PlainSecurity))
            .await
            .unwrap();
        drop(listener);

        link.sender()
            .send(LinkCommand::Text(
                r#"{"jsonrpc":"2.0","id":1,"method":"add","params":[1,2]}"#.to_string(),
            ))
            .await
            .unwrap();
        match link.next_event().await {
            Some(LinkEvent::Closed(_)) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
    }
}
