//! jsonbus - JSON-RPC 2.0 messaging over interchangeable transports.
//!
//! One API for request/reply and topic publish/subscribe, carried over
//! HTTP, WebSocket or ZMTP 3.1 TCP. Pick the transport by URI scheme; the
//! session you get back behaves the same way on each of them.
//!
//! # Example
//!
//! ```rust,ignore
//! use jsonbus::{Bus, BusOptions, MethodTable};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> jsonbus::Result<()> {
//!     let bus = Bus::with_default_transports(BusOptions::default());
//!
//!     let table = MethodTable::builder()
//!         .method("echo", |call| async move { Ok(call.params) })
//!         .build();
//!     let responder = bus.responder("tcp://127.0.0.1:5555", Arc::new(table)).await?;
//!
//!     let requester = bus.requester("tcp://127.0.0.1:5555")?;
//!     requester.wait_ready(Duration::from_secs(5)).await?;
//!     let echoed = requester.call("echo", json!({"hello": "world"})).await?;
//!     println!("{}", echoed);
//!
//!     responder.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod retry;
pub mod security;
pub mod session;
pub mod transport;

mod bus;

// Re-export commonly used types
pub use bus::Bus;
pub use config::{BusConfig, BusOptions};
pub use correlation::ReplyFuture;
pub use dispatch::{IncomingCall, MethodTable, MethodTableBuilder, PeerContext, RequestHandler};
pub use endpoint::{Endpoint, SessionOptions, TlsPolicy};
pub use error::{BusError, Result};
pub use retry::RetryConfig;
pub use security::{PlainSecurity, SecurityProvider, StaticCredentials};
pub use session::{
    Publication, Publisher, Requester, Responder, Role, Session, SessionState, Subscriber,
};
pub use transport::Transport;

// Protocol types
pub use jsonbus_proto::{
    codec, codes, CompatRules, ErrorObject, Id, Message, MessageBuilder, MessageKind, Metadata,
    Notification, ParseError, Reply, Request,
};
