//! Binary wire protocol (ZMTP 3.1 with ZMTP 2.0 fallback).
//!
//! Everything here is sans-I/O: the transport adapter owns the socket and
//! drives a [`WireEngine`] with the bytes it reads.

pub mod command;
pub mod engine;
pub mod frame;
pub mod greeting;
pub mod socket_type;

pub use command::{Command, HandshakeCommand, Properties};
pub use engine::{EngineConfig, PeerInfo, PlainAuthenticator, WireEngine, WireEvent, WireState};
pub use frame::{Frame, Framing};
pub use greeting::{Mechanism, PeerGeneration};
pub use socket_type::SocketType;

/// Wire protocol limits.
pub struct WireConfig;

impl WireConfig {
    /// Largest frame payload accepted from a peer (16 MiB).
    pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

    /// Initial capacity of the engine's in/out buffers.
    pub const INITIAL_BUFFER: usize = 8 * 1024;
}
