//! # jsonbus-proto
//!
//! Sans-I/O protocol layer for jsonbus.
//!
//! - [`message`]: the four JSON-RPC 2.0 message kinds and their builder
//! - [`codec`]: canonical encoding and batch-tolerant decoding
//! - [`compat`]: bare-value / single-field-object bridging
//! - [`wire`]: the ZMTP greeting, handshake and framing engine
//! - [`subscription`]: topic prefix sets
//!
//! Nothing in this crate opens a socket or needs a runtime.

pub mod codec;
pub mod compat;
pub mod error;
pub mod message;
pub mod subscription;
pub mod wire;

pub use codec::DecodeMode;
pub use compat::CompatRules;
pub use error::{ProtoError, Result};
pub use message::{
    codes, ErrorObject, Id, Message, MessageBuilder, MessageKind, Metadata, Notification,
    ParseError, Reply, ReplyBody, Request, JSONRPC_VERSION,
};
pub use subscription::SubscriptionSet;
