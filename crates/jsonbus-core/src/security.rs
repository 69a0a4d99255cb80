//! Security collaborator seam.
//!
//! The bus never loads keys or parses certificates. A [`SecurityProvider`]
//! decides who may connect and may wrap raw TCP streams into secured ones.

use crate::endpoint::{Endpoint, SessionOptions};
use crate::error::{BusError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonbus_proto::wire::PlainAuthenticator;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Authentication and channel security for all transports.
#[async_trait]
pub trait SecurityProvider: Send + Sync + 'static {
    /// Check a username/password pair.
    fn authenticate(&self, username: &str, password: &str) -> bool;

    /// Whether servers must demand credentials from every peer.
    fn requires_authentication(&self) -> bool {
        false
    }

    /// Wrap an outgoing connection.
    async fn secure_client(&self, stream: TcpStream, endpoint: &Endpoint) -> Result<BoxedStream>;

    /// Wrap an accepted connection.
    async fn secure_server(&self, stream: TcpStream, options: &SessionOptions) -> Result<BoxedStream>;
}

/// Pass-through provider: no TLS, no credentials required.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSecurity;

#[async_trait]
impl SecurityProvider for PlainSecurity {
    fn authenticate(&self, _username: &str, _password: &str) -> bool {
        true
    }

    async fn secure_client(&self, stream: TcpStream, endpoint: &Endpoint) -> Result<BoxedStream> {
        if endpoint.options().tls_required() {
            return Err(BusError::Security {
                message: format!("{} requires TLS but no TLS provider is configured", endpoint),
            });
        }
        Ok(Box::new(stream))
    }

    async fn secure_server(&self, stream: TcpStream, options: &SessionOptions) -> Result<BoxedStream> {
        if options.tls_required() {
            return Err(BusError::Security {
                message: "TLS required but no TLS provider is configured".to_string(),
            });
        }
        Ok(Box::new(stream))
    }
}

/// Fixed username/password table; streams pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

#[async_trait]
impl SecurityProvider for StaticCredentials {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .map(|expected| expected == password)
            .unwrap_or(false)
    }

    fn requires_authentication(&self) -> bool {
        true
    }

    async fn secure_client(&self, stream: TcpStream, endpoint: &Endpoint) -> Result<BoxedStream> {
        PlainSecurity.secure_client(stream, endpoint).await
    }

    async fn secure_server(&self, stream: TcpStream, options: &SessionOptions) -> Result<BoxedStream> {
        PlainSecurity.secure_server(stream, options).await
    }
}

/// Bridges a provider into the wire engine's PLAIN mechanism.
pub(crate) struct ProviderAuthenticator(pub Arc<dyn SecurityProvider>);

impl PlainAuthenticator for ProviderAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.0.authenticate(username, password)
    }
}

/// `Authorization` header value for HTTP Basic auth.
pub fn basic_auth_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

/// Decode an HTTP Basic `Authorization` header.
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?.trim();
    let decoded = STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Check an optional `Authorization` header against the provider.
///
/// Providers that don't require authentication accept everything.
pub(crate) fn check_basic_auth(security: &dyn SecurityProvider, header: Option<&str>) -> bool {
    if !security.requires_authentication() {
        return true;
    }
    match header.and_then(parse_basic_auth) {
        Some((user, password)) => security.authenticate(&user, &password),
        None => false,
    }
}
