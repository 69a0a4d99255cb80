//! The bus: a transport registry that opens sessions.

use crate::config::BusOptions;
use crate::dispatch::{MethodTable, RequestHandler};
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::session::{Publisher, Requester, Responder, Role, Session, Subscriber};
use crate::transport::{BinaryTransport, DuplexTransport, HttpTransport, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;
use uuid::Uuid;

/// Opens sessions by URI scheme.
///
/// Transports are registered explicitly; nothing is discovered at runtime.
///
/// ```rust,ignore
/// let bus = Bus::with_default_transports(BusOptions::default());
/// let requester = bus.requester("tcp://127.0.0.1:5555")?;
/// requester.wait_ready(Duration::from_secs(5)).await?;
/// let sum = requester.call("add", json!([1, 2])).await?;
/// ```
pub struct Bus {
    transports: HashMap<String, Arc<dyn Transport>>,
    options: BusOptions,
}

impl Bus {
    /// A bus with exactly the given `(scheme, transport)` pairs.
    pub fn new<S: Into<String>>(transports: Vec<(S, Arc<dyn Transport>)>) -> Self {
        Self::with_options(transports, BusOptions::default())
    }

    pub fn with_options<S: Into<String>>(
        transports: Vec<(S, Arc<dyn Transport>)>,
        options: BusOptions,
    ) -> Self {
        let transports = transports
            .into_iter()
            .map(|(scheme, transport)| (scheme.into().to_ascii_lowercase(), transport))
            .collect();
        Self {
            transports,
            options,
        }
    }

    /// HTTP (`http`, `https`), WebSocket (`ws`, `wss`) and ZMTP (`tcp`,
    /// `zmtp`).
    pub fn with_default_transports(options: BusOptions) -> Self {
        let http: Arc<dyn Transport> = Arc::new(HttpTransport::new());
        let duplex: Arc<dyn Transport> = Arc::new(DuplexTransport::new());
        let binary: Arc<dyn Transport> = Arc::new(BinaryTransport::new());
        Self::with_options(
            vec![
                ("http", http.clone()),
                ("https", http),
                ("ws", duplex.clone()),
                ("wss", duplex),
                ("tcp", binary.clone()),
                ("zmtp", binary),
            ],
            options,
        )
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.transports.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Capability matrix lookup.
    pub fn supports(&self, scheme: &str, role: Role) -> bool {
        self.transports
            .get(&scheme.to_ascii_lowercase())
            .is_some_and(|t| t.supports(role))
    }

    fn resolve(&self, uri: &str, role: Role) -> Result<(Endpoint, Arc<dyn Transport>)> {
        let endpoint = Endpoint::parse(uri)?;
        let transport = self
            .transports
            .get(endpoint.scheme())
            .cloned()
            .ok_or_else(|| BusError::UnknownScheme {
                scheme: endpoint.scheme().to_string(),
            })?;
        if !transport.supports(role) {
            return Err(BusError::UnsupportedRole {
                scheme: endpoint.scheme().to_string(),
                role,
            });
        }
        Ok((endpoint, transport))
    }

    fn runtime() -> Result<Handle> {
        Handle::try_current().map_err(|_| BusError::transport("sessions need a running tokio runtime"))
    }

    /// Open a session of any role.
    ///
    /// Responders start with an empty method table; install one with
    /// [`Responder::on_request`].
    pub async fn create_session(&self, uri: &str, role: Role) -> Result<Session> {
        match role {
            Role::Requester => self.requester(uri).map(Session::Requester),
            Role::Responder => self
                .responder(uri, Arc::new(MethodTable::empty()))
                .await
                .map(Session::Responder),
            Role::Publisher => self.publisher(uri).await.map(Session::Publisher),
            Role::Subscriber => self.subscriber(uri).map(Session::Subscriber),
        }
    }

    /// Start a Requester; it connects in the background.
    pub fn requester(&self, uri: &str) -> Result<Requester> {
        let (endpoint, transport) = self.resolve(uri, Role::Requester)?;
        let runtime = Self::runtime()?;
        let id = new_session_id();
        debug!("Opening Requester {} for {}", id, endpoint);
        Ok(Requester::start(endpoint, transport, &self.options, runtime, id))
    }

    /// Bind a Responder serving `handler`.
    pub async fn responder(&self, uri: &str, handler: Arc<dyn RequestHandler>) -> Result<Responder> {
        let (endpoint, transport) = self.resolve(uri, Role::Responder)?;
        let id = new_session_id();
        debug!("Opening Responder {} for {}", id, endpoint);
        Responder::start(endpoint, transport, &self.options, handler, id).await
    }

    pub async fn publisher(&self, uri: &str) -> Result<Publisher> {
        let (endpoint, transport) = self.resolve(uri, Role::Publisher)?;
        let id = new_session_id();
        debug!("Opening Publisher {} for {}", id, endpoint);
        Publisher::start(endpoint, transport, &self.options, id).await
    }

    /// Start a Subscriber; topics from the URI are subscribed up front.
    pub fn subscriber(&self, uri: &str) -> Result<Subscriber> {
        let (endpoint, transport) = self.resolve(uri, Role::Subscriber)?;
        let runtime = Self::runtime()?;
        let id = new_session_id();
        debug!("Opening Subscriber {} for {}", id, endpoint);
        Ok(Subscriber::start(endpoint, transport, &self.options, runtime, id))
    }
}

fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_matrix() {
        let bus = Bus::with_default_transports(BusOptions::default());
        for role in Role::ALL {
            assert!(bus.supports("ws", role));
            assert!(bus.supports("tcp", role));
            assert!(bus.supports("ZMTP", role));
        }
        assert!(bus.supports("http", Role::Requester));
        assert!(bus.supports("https", Role::Responder));
        assert!(!bus.supports("http", Role::Publisher));
        assert!(!bus.supports("http", Role::Subscriber));
        assert!(!bus.supports("udp", Role::Requester));
    }

    #[tokio::test]
    async fn test_unsupported_role_and_unknown_scheme() {
        let bus = Bus::with_default_transports(BusOptions::default());
        match bus.create_session("http://127.0.0.1:0/rpc", Role::Publisher).await {
            Err(BusError::UnsupportedRole { scheme, role }) => {
                assert_eq!(scheme, "http");
                assert_eq!(role, Role::Publisher);
            }
            other => panic!("expected UnsupportedRole, got {:?}", other),
        }

        assert!(matches!(
            bus.create_session("udp://127.0.0.1:9", Role::Requester).await,
            Err(BusError::UnknownScheme { .. })
        ));
        assert!(matches!(
            bus.create_session("not a uri", Role::Requester).await,
            Err(BusError::InvalidUri { .. })
        ));
    }

    #[test]
    fn test_explicit_registry() {
        let binary: Arc<dyn Transport> = Arc::new(BinaryTransport::new());
        let bus = Bus::new(vec![("TCP", binary)]);
        assert_eq!(bus.schemes(), vec!["tcp"]);
        assert!(!bus.supports("ws", Role::Requester));
    }

    #[test]
    fn test_client_needs_runtime() {
        let bus = Bus::with_default_transports(BusOptions::default());
        assert!(bus.requester("tcp://127.0.0.1:5555").is_err());
    }
}
