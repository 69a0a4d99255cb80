//! Session addressing.
//!
//! A session URI looks like `scheme://[user:password@]host:port[/path][?query]`.
//! The scheme picks the transport; query options tune the session:
//!
//! | key          | meaning                                         |
//! |--------------|-------------------------------------------------|
//! | `tls`        | `off` (default) or `required`                   |
//! | `user`       | username for Basic auth / ZMTP PLAIN            |
//! | `password`   | password for Basic auth / ZMTP PLAIN            |
//! | `topic`      | initial Subscriber topic, may repeat            |
//! | `timeout_ms` | default reply timeout                           |
//! | `retries`    | reconnect attempts                              |
//! | `identity`   | ZMTP identity announced in the handshake        |

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use std::fmt;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// TLS policy requested by a URI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsPolicy {
    #[default]
    Off,
    Required,
}

/// Options parsed from the URI query and userinfo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub tls: TlsPolicy,
    pub user: Option<String>,
    pub password: Option<String>,
    pub topics: Vec<String>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub identity: Option<String>,
}

impl SessionOptions {
    fn from_url(raw: &str, url: &Url) -> Result<Self> {
        let mut options = SessionOptions::default();

        if !url.username().is_empty() {
            options.user = Some(url.username().to_string());
        }
        if let Some(password) = url.password() {
            options.password = Some(password.to_string());
        }

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "tls" => {
                    options.tls = match value.as_ref() {
                        "off" | "false" | "0" => TlsPolicy::Off,
                        "required" | "true" | "1" => TlsPolicy::Required,
                        other => {
                            return Err(BusError::invalid_uri(
                                raw,
                                format!("tls must be off or required, got {}", other),
                            ))
                        }
                    }
                }
                "user" => options.user = Some(value.into_owned()),
                "password" => options.password = Some(value.into_owned()),
                "topic" => options.topics.push(value.into_owned()),
                "timeout_ms" => {
                    let ms: u64 = value.parse().map_err(|_| {
                        BusError::invalid_uri(raw, format!("timeout_ms is not a number: {}", value))
                    })?;
                    options.timeout = Some(Duration::from_millis(ms));
                }
                "retries" => {
                    let retries: u32 = value.parse().map_err(|_| {
                        BusError::invalid_uri(raw, format!("retries is not a number: {}", value))
                    })?;
                    options.retries = Some(retries);
                }
                "identity" => options.identity = Some(value.into_owned()),
                other => warn!("Ignoring unknown session option {} in {}", other, raw),
            }
        }

        Ok(options)
    }

    /// Username and password, when a username is configured.
    pub fn credentials(&self) -> Option<(String, String)> {
        self.user
            .as_ref()
            .map(|user| (user.clone(), self.password.clone().unwrap_or_default()))
    }

    pub fn tls_required(&self) -> bool {
        self.tls == TlsPolicy::Required
    }
}

/// A parsed session URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    raw: String,
    scheme: String,
    host: String,
    port: u16,
    path: String,
    options: SessionOptions,
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| BusError::invalid_uri(uri, e.to_string()))?;

        let scheme = url.scheme().to_ascii_lowercase();
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BusError::invalid_uri(uri, "missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| BusError::invalid_uri(uri, "missing port"))?;
        let path = match url.path() {
            "" | "/" => BusConfig::RPC_PATH.to_string(),
            p => p.to_string(),
        };
        let options = SessionOptions::from_url(uri, &url)?;

        Ok(Self {
            raw: uri.to_string(),
            scheme,
            host,
            port,
            path,
            options,
        })
    }

    /// The URI exactly as given.
    pub fn uri(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Whether the scheme or the `tls` option asks for an encrypted channel.
    pub fn tls_required(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss") || self.options.tls_required()
    }

    /// URL for a client connection using `plain` or `secure` as scheme.
    pub fn client_url(&self, plain: &str, secure: &str) -> String {
        let scheme = if self.tls_required() { secure } else { plain };
        format!("{}://{}{}", scheme, self.authority(), self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority(), self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binary_endpoint() {
        let ep = Endpoint::parse("tcp://127.0.0.1:5555?identity=worker-1&retries=2").unwrap();
        assert_eq!(ep.scheme(), "tcp");
        assert_eq!(ep.authority(), "127.0.0.1:5555");
        assert_eq!(ep.options().identity.as_deref(), Some("worker-1"));
        assert_eq!(ep.options().retries, Some(2));
        assert!(!ep.tls_required());
    }

    #[test]
    fn test_default_path_and_port() {
        let ep = Endpoint::parse("http://localhost").unwrap();
        assert_eq!(ep.port(), 80);
        assert_eq!(ep.path(), BusConfig::RPC_PATH);
        assert_eq!(ep.client_url("http", "https"), "http://localhost:80/rpc");

        let ep = Endpoint::parse("wss://example.com/bus").unwrap();
        assert_eq!(ep.port(), 443);
        assert!(ep.tls_required());
        assert_eq!(ep.client_url("ws", "wss"), "wss://example.com:443/bus");
    }

    #[test]
    fn test_binary_requires_port() {
        assert!(matches!(
            Endpoint::parse("tcp://127.0.0.1"),
            Err(BusError::InvalidUri { .. })
        ));
    }

    #[test]
    fn test_repeated_topics_and_credentials() {
        let ep = Endpoint::parse("ws://admin:secret@127.0.0.1:9000/bus?topic=A&topic=B&tls=off")
            .unwrap();
        assert_eq!(ep.options().topics, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(
            ep.options().credentials(),
            Some(("admin".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(Endpoint::parse("tcp://127.0.0.1:1?tls=maybe").is_err());
        assert!(Endpoint::parse("tcp://127.0.0.1:1?timeout_ms=soon").is_err());
        assert!(Endpoint::parse("not a uri").is_err());
    }

    #[test]
    fn test_timeout_option() {
        let ep = Endpoint::parse("http://127.0.0.1:8080/rpc?timeout_ms=250").unwrap();
        assert_eq!(ep.options().timeout, Some(Duration::from_millis(250)));
    }
}
