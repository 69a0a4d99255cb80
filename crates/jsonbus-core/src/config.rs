//! Centralized configuration for jsonbus.
//!
//! Constants for timeouts, queue sizes and limits, plus the runtime
//! [`BusOptions`] handed to [`Bus`](crate::Bus).

use crate::retry::RetryConfig;
use crate::security::{PlainSecurity, SecurityProvider};
use jsonbus_proto::CompatRules;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use jsonbus_proto::wire::WireConfig;

/// Session-level defaults.
pub struct BusConfig;

impl BusConfig {
    /// Default wait for a reply in `call` and the blocking helpers.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// Greeting plus handshake must finish within this window.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Slack a blocking helper grants the runtime past its own timeout.
    pub const BLOCKING_MARGIN: Duration = Duration::from_secs(1);

    // Reconnect controller
    pub const RECONNECT_ATTEMPTS: u32 = 5;
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(200);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

    // Queues
    pub const LINK_QUEUE: usize = 64;
    pub const PEER_QUEUE: usize = 256;
    pub const SUBSCRIBER_QUEUE: usize = 1024;

    /// Maximum concurrent peer connections per listener.
    pub const MAX_CONNECTIONS: usize = 256;
    /// Maximum in-flight HTTP requests per responder.
    pub const MAX_CONCURRENT_HTTP: usize = 128;

    /// Default endpoint path for the HTTP and WebSocket transports.
    pub const RPC_PATH: &'static str = "/rpc";
    pub const HEALTH_PATH: &'static str = "/health";

    /// Read buffer size for the binary transport.
    pub const READ_BUFFER: usize = 8 * 1024;
}

/// Runtime options shared by every session a [`Bus`](crate::Bus) creates.
#[derive(Clone)]
pub struct BusOptions {
    pub security: Arc<dyn SecurityProvider>,
    pub retry: RetryConfig,
    pub compat: CompatRules,
    pub request_timeout: Duration,
    pub max_connections: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            security: Arc::new(PlainSecurity),
            retry: RetryConfig::new()
                .with_max_attempts(BusConfig::RECONNECT_ATTEMPTS)
                .with_base_delay(BusConfig::RECONNECT_BASE_DELAY)
                .with_max_delay(BusConfig::RECONNECT_MAX_DELAY),
            compat: CompatRules::new(),
            request_timeout: BusConfig::REQUEST_TIMEOUT,
            max_connections: BusConfig::MAX_CONNECTIONS,
        }
    }
}

impl BusOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityProvider>) -> Self {
        self.security = security;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compat(mut self, compat: CompatRules) -> Self {
        self.compat = compat;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

impl fmt::Debug for BusOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusOptions")
            .field("retry", &self.retry)
            .field("compat", &self.compat)
            .field("request_timeout", &self.request_timeout)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}
