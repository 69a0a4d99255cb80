//! Sans-I/O ZMTP connection state machine.
//!
//! The engine never touches a socket. The driver feeds it whatever bytes
//! arrived, collects the returned events, and writes out whatever
//! [`WireEngine::poll_transmit`] hands back.
//!
//! # State machine
//!
//! ```text
//! ┌──────────┐ peer major ≥ 3 ┌───────────┐  READY  ┌───────┐
//! │ Greeting │───────────────>│ Handshake │────────>│ Ready │
//! └──────────┘                └───────────┘         └───────┘
//!      │ peer major 1/2 (socket type + identity)        ↑
//!      └────────────────────────────────────────────────┘
//!
//! any violation ──> Closed (no recovery, the connection is reset)
//! ```
//!
//! Data frames are refused in both directions until the handshake has
//! completed, and a second `READY` once ready is a violation.

use super::command::{
    self, Command, HandshakeCommand, Properties, PROP_IDENTITY, PROP_SOCKET_TYPE,
};
use super::frame::{Frame, Framing};
use super::greeting::{self, GreetingTail, Mechanism, PeerGeneration, PREAMBLE_LEN, TAIL_LEN};
use super::socket_type::SocketType;
use super::WireConfig;
use crate::error::{ProtoError, Result};
use crate::subscription::SubscriptionSet;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Server-side credential check for the PLAIN mechanism.
pub trait PlainAuthenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Engine settings for one connection.
#[derive(Clone)]
pub struct EngineConfig {
    pub socket_type: SocketType,
    pub identity: Bytes,
    pub max_frame_size: u64,
    /// Client PLAIN credentials.
    pub credentials: Option<(String, String)>,
    /// Server PLAIN authenticator.
    pub authenticator: Option<Arc<dyn PlainAuthenticator>>,
}

impl EngineConfig {
    pub fn new(socket_type: SocketType) -> Self {
        Self {
            socket_type,
            identity: Bytes::new(),
            max_frame_size: WireConfig::MAX_FRAME_SIZE,
            credentials: None,
            authenticator: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<Bytes>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_max_frame_size(mut self, max: u64) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn PlainAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    fn mechanism(&self) -> Mechanism {
        if self.credentials.is_some() || self.authenticator.is_some() {
            Mechanism::Plain
        } else {
            Mechanism::Null
        }
    }

    fn as_server(&self) -> bool {
        self.authenticator.is_some()
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("socket_type", &self.socket_type)
            .field("identity", &self.identity)
            .field("max_frame_size", &self.max_frame_size)
            .field("plain_client", &self.credentials.is_some())
            .field("plain_server", &self.authenticator.is_some())
            .finish()
    }
}

/// Coarse connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
    Greeting,
    Handshake,
    Ready,
    Closed,
}

impl fmt::Display for WireState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireState::Greeting => write!(f, "GREETING"),
            WireState::Handshake => write!(f, "HANDSHAKE"),
            WireState::Ready => write!(f, "READY"),
            WireState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Preamble,
    GreetingTail,
    LegacySocketType,
    LegacyIdentity,
    AwaitReady,
    AwaitHello,
    AwaitWelcome,
    AwaitInitiate,
    Ready,
    Closed,
}

/// What the engine learned about the peer during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub socket_type: SocketType,
    pub identity: Bytes,
    pub generation: PeerGeneration,
    pub minor: u8,
    pub properties: Properties,
    /// PLAIN username the peer authenticated with.
    pub username: Option<String>,
}

/// Output of [`WireEngine::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    HandshakeComplete(PeerInfo),
    /// A complete multi-part message.
    Message(Vec<Bytes>),
    /// The peer added a subscription (already applied).
    Subscribed(Bytes),
    /// The peer removed a subscription (already applied).
    Cancelled(Bytes),
}

/// Per-connection ZMTP protocol engine.
pub struct WireEngine {
    config: EngineConfig,
    mechanism: Mechanism,
    stage: Stage,
    framing: Framing,
    peer_minor: u8,
    inbound: BytesMut,
    outbound: BytesMut,
    parts: Vec<Bytes>,
    legacy_peer_type: Option<SocketType>,
    plain_user: Option<String>,
    peer: Option<PeerInfo>,
    peer_subscriptions: SubscriptionSet,
}

impl WireEngine {
    /// Create an engine; our signature is queued for transmission at once.
    pub fn new(config: EngineConfig) -> Self {
        let mut outbound = BytesMut::with_capacity(WireConfig::INITIAL_BUFFER);
        greeting::write_preamble(&mut outbound);
        Self {
            mechanism: config.mechanism(),
            config,
            stage: Stage::Preamble,
            framing: Framing::Current,
            peer_minor: 0,
            inbound: BytesMut::with_capacity(WireConfig::INITIAL_BUFFER),
            outbound,
            parts: Vec::new(),
            legacy_peer_type: None,
            plain_user: None,
            peer: None,
            peer_subscriptions: SubscriptionSet::new(),
        }
    }

    pub fn state(&self) -> WireState {
        match self.stage {
            Stage::Preamble | Stage::GreetingTail | Stage::LegacySocketType | Stage::LegacyIdentity => {
                WireState::Greeting
            }
            Stage::AwaitReady | Stage::AwaitHello | Stage::AwaitWelcome | Stage::AwaitInitiate => {
                WireState::Handshake
            }
            Stage::Ready => WireState::Ready,
            Stage::Closed => WireState::Closed,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.stage == Stage::Ready
    }

    pub fn socket_type(&self) -> SocketType {
        self.config.socket_type
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    /// Subscriptions the peer has registered with us (publisher side).
    pub fn peer_subscriptions(&self) -> &SubscriptionSet {
        &self.peer_subscriptions
    }

    /// Bytes waiting to be written to the socket.
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split().freeze())
        }
    }

    /// Feed received bytes and collect resulting events.
    ///
    /// Any error closes the engine for good. An `ERROR` command may still be
    /// queued for the peer; flush [`poll_transmit`](Self::poll_transmit)
    /// before dropping the socket.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<WireEvent>> {
        if self.stage == Stage::Closed {
            return Err(ProtoError::Closed);
        }
        self.inbound.extend_from_slice(data);

        let mut events = Vec::new();
        match self.process(&mut events) {
            Ok(()) => Ok(events),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Queue a multi-part application message.
    pub fn send_message(&mut self, parts: &[Bytes]) -> Result<()> {
        self.ensure_ready()?;
        if parts.is_empty() {
            return Err(ProtoError::Frame {
                message: "a message needs at least one part".to_string(),
            });
        }
        let last = parts.len() - 1;
        for (i, part) in parts.iter().enumerate() {
            Frame::data(part.clone(), i < last).encode(self.framing, &mut self.outbound)?;
        }
        Ok(())
    }

    /// Ask the peer publisher for messages starting with `topic`.
    pub fn subscribe(&mut self, topic: &[u8]) -> Result<()> {
        self.send_subscription(true, topic)
    }

    /// Withdraw a subscription.
    pub fn cancel(&mut self, topic: &[u8]) -> Result<()> {
        self.send_subscription(false, topic)
    }

    /// Close the engine locally.
    pub fn close(&mut self) {
        self.stage = Stage::Closed;
        self.inbound.clear();
        self.parts.clear();
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.stage {
            Stage::Ready => Ok(()),
            Stage::Closed => Err(ProtoError::Closed),
            _ => Err(ProtoError::NotReady {
                state: self.state().to_string(),
            }),
        }
    }

    fn send_subscription(&mut self, subscribe: bool, topic: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        if self.framing == Framing::Current && self.peer_minor >= 1 {
            let name = if subscribe { command::SUBSCRIBE } else { command::CANCEL };
            self.send_command(Command::new(name, Bytes::copy_from_slice(topic)))
        } else {
            // ZMTP 2.0 and 3.0 carry subscriptions as prefixed messages
            let mut body = BytesMut::with_capacity(1 + topic.len());
            body.put_u8(subscribe as u8);
            body.extend_from_slice(topic);
            Frame::data(body.freeze(), false).encode(self.framing, &mut self.outbound)
        }
    }

    fn send_command(&mut self, cmd: Command) -> Result<()> {
        Frame::command(cmd.encode()?).encode(self.framing, &mut self.outbound)
    }

    fn local_properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert(
            PROP_SOCKET_TYPE,
            Bytes::from_static(self.config.socket_type.as_str().as_bytes()),
        );
        props.insert(PROP_IDENTITY, self.config.identity.clone());
        props
    }

    fn fail(&mut self, err: &ProtoError) {
        let tell_peer = matches!(
            err,
            ProtoError::SocketMismatch { .. } | ProtoError::AuthRejected { .. }
        ) && self.framing == Framing::Current
            && self.stage != Stage::Preamble
            && self.stage != Stage::GreetingTail;
        if tell_peer {
            let reason = err.to_string();
            if let Err(e) = self.send_command(Command::error(&reason)) {
                debug!("Could not queue ERROR command: {}", e);
            }
        }
        warn!("ZMTP {} connection reset: {}", self.config.socket_type, err);
        self.close();
    }

    fn process(&mut self, events: &mut Vec<WireEvent>) -> Result<()> {
        loop {
            let progressed = match self.stage {
                Stage::Preamble => self.read_preamble()?,
                Stage::GreetingTail => self.read_greeting_tail()?,
                Stage::LegacySocketType => self.read_legacy_socket_type()?,
                Stage::LegacyIdentity => self.read_legacy_identity(events)?,
                Stage::AwaitReady | Stage::AwaitHello | Stage::AwaitWelcome | Stage::AwaitInitiate => {
                    self.read_handshake(events)?
                }
                Stage::Ready => self.read_ready(events)?,
                Stage::Closed => return Err(ProtoError::Closed),
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Greeting
    // ------------------------------------------------------------------

    fn read_preamble(&mut self) -> Result<bool> {
        let generation = match greeting::check_preamble(&self.inbound)? {
            Some(g) => g,
            None => return Ok(false),
        };
        self.inbound.advance(PREAMBLE_LEN);

        match generation {
            PeerGeneration::Current => {
                greeting::write_tail(&mut self.outbound, self.mechanism, self.config.as_server());
                self.stage = Stage::GreetingTail;
            }
            PeerGeneration::Legacy => {
                if self.mechanism != Mechanism::Null {
                    return Err(ProtoError::Greeting {
                        message: "legacy peers cannot use the PLAIN mechanism".to_string(),
                    });
                }
                debug!("Peer speaks ZMTP 2.0, switching to legacy framing");
                self.framing = Framing::Legacy;
                self.outbound.put_u8(self.config.socket_type.legacy_code());
                Frame::data(self.config.identity.clone(), false)
                    .encode(Framing::Legacy, &mut self.outbound)?;
                self.stage = Stage::LegacySocketType;
            }
        }
        Ok(true)
    }

    fn read_greeting_tail(&mut self) -> Result<bool> {
        if self.inbound.len() < TAIL_LEN {
            return Ok(false);
        }
        let tail = GreetingTail::decode(&self.inbound[..TAIL_LEN])?;
        self.inbound.advance(TAIL_LEN);

        if tail.mechanism != self.mechanism {
            return Err(ProtoError::Handshake {
                message: format!(
                    "mechanism mismatch: local {}, peer {}",
                    self.mechanism.as_str(),
                    tail.mechanism.as_str()
                ),
            });
        }
        if self.mechanism == Mechanism::Plain && tail.as_server == self.config.as_server() {
            return Err(ProtoError::Handshake {
                message: "both peers claim the same PLAIN role".to_string(),
            });
        }
        self.peer_minor = tail.minor;

        match (self.mechanism, self.config.as_server()) {
            (Mechanism::Null, _) => {
                let ready = HandshakeCommand::ready(self.local_properties()).to_command()?;
                self.send_command(ready)?;
                self.stage = Stage::AwaitReady;
            }
            (Mechanism::Plain, false) => {
                let (user, pass) = self.config.credentials.clone().unwrap_or_default();
                self.send_command(Command::hello(&user, &pass)?)?;
                self.stage = Stage::AwaitWelcome;
            }
            (Mechanism::Plain, true) => {
                self.stage = Stage::AwaitHello;
            }
        }
        Ok(true)
    }

    fn read_legacy_socket_type(&mut self) -> Result<bool> {
        if self.inbound.is_empty() {
            return Ok(false);
        }
        let code = self.inbound.get_u8();
        let peer_type = SocketType::from_legacy_code(code).ok_or_else(|| ProtoError::Handshake {
            message: format!("unknown legacy socket type {:#04x}", code),
        })?;
        self.legacy_peer_type = Some(peer_type);
        self.stage = Stage::LegacyIdentity;
        Ok(true)
    }

    fn read_legacy_identity(&mut self, events: &mut Vec<WireEvent>) -> Result<bool> {
        let frame = match Frame::decode(&mut self.inbound, Framing::Legacy, self.config.max_frame_size)? {
            Some(f) => f,
            None => return Ok(false),
        };
        if frame.more {
            return Err(ProtoError::Handshake {
                message: "legacy identity frame has MORE set".to_string(),
            });
        }
        let peer_type = self.legacy_peer_type.ok_or_else(|| ProtoError::Handshake {
            message: "identity before socket type".to_string(),
        })?;
        self.check_pairing(peer_type)?;

        let peer = PeerInfo {
            socket_type: peer_type,
            identity: frame.payload,
            generation: PeerGeneration::Legacy,
            minor: 0,
            properties: Properties::new(),
            username: None,
        };
        self.become_ready(peer, events);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    fn read_handshake(&mut self, events: &mut Vec<WireEvent>) -> Result<bool> {
        let frame = match Frame::decode(&mut self.inbound, Framing::Current, self.config.max_frame_size)? {
            Some(f) => f,
            None => return Ok(false),
        };
        if !frame.command {
            return Err(ProtoError::PrematureData);
        }
        let cmd = Command::decode(&frame.payload)?;

        if cmd.is(command::ERROR) {
            let reason = cmd.error_reason();
            return Err(if self.stage == Stage::AwaitWelcome {
                ProtoError::AuthRejected { reason }
            } else {
                ProtoError::Handshake {
                    message: format!("peer sent ERROR: {}", reason),
                }
            });
        }

        match (self.stage, cmd.name.as_str()) {
            (Stage::AwaitReady, command::READY) => {
                let ready = HandshakeCommand::from_command(&cmd)?;
                let peer = self.peer_from_properties(ready.properties)?;
                self.become_ready(peer, events);
            }
            (Stage::AwaitHello, command::HELLO) => {
                let (user, pass) = cmd.hello_credentials()?;
                let accepted = self
                    .config
                    .authenticator
                    .as_ref()
                    .map(|auth| auth.authenticate(&user, &pass))
                    .unwrap_or(false);
                if !accepted {
                    return Err(ProtoError::AuthRejected {
                        reason: format!("invalid credentials for {}", user),
                    });
                }
                debug!("PLAIN user {} authenticated", user);
                self.plain_user = Some(user);
                self.send_command(Command::new(command::WELCOME, Bytes::new()))?;
                self.stage = Stage::AwaitInitiate;
            }
            (Stage::AwaitWelcome, command::WELCOME) => {
                let initiate = HandshakeCommand::initiate(self.local_properties()).to_command()?;
                self.send_command(initiate)?;
                self.stage = Stage::AwaitReady;
            }
            (Stage::AwaitInitiate, command::INITIATE) => {
                let initiate = HandshakeCommand::from_command(&cmd)?;
                let peer = self.peer_from_properties(initiate.properties)?;
                let ready = HandshakeCommand::ready(self.local_properties()).to_command()?;
                self.send_command(ready)?;
                self.become_ready(peer, events);
            }
            (_, name) => {
                return Err(ProtoError::Handshake {
                    message: format!("unexpected {} command during handshake", name),
                });
            }
        }
        Ok(true)
    }

    fn peer_from_properties(&self, properties: Properties) -> Result<PeerInfo> {
        let raw_type = properties.get(PROP_SOCKET_TYPE).ok_or_else(|| ProtoError::Handshake {
            message: "peer did not announce Socket-Type".to_string(),
        })?;
        let socket_type = SocketType::from_name(raw_type).ok_or_else(|| ProtoError::Handshake {
            message: format!("unknown socket type {:?}", String::from_utf8_lossy(raw_type)),
        })?;
        self.check_pairing(socket_type)?;

        Ok(PeerInfo {
            socket_type,
            identity: properties.get(PROP_IDENTITY).cloned().unwrap_or_default(),
            generation: PeerGeneration::Current,
            minor: self.peer_minor,
            properties,
            username: self.plain_user.clone(),
        })
    }

    fn check_pairing(&self, peer: SocketType) -> Result<()> {
        if self.config.socket_type.can_pair_with(peer) {
            Ok(())
        } else {
            Err(ProtoError::SocketMismatch {
                local: self.config.socket_type.to_string(),
                peer: peer.to_string(),
            })
        }
    }

    fn become_ready(&mut self, peer: PeerInfo, events: &mut Vec<WireEvent>) {
        debug!(
            "ZMTP handshake complete: {} <-> {} ({:?})",
            self.config.socket_type, peer.socket_type, peer.generation
        );
        self.stage = Stage::Ready;
        self.peer = Some(peer.clone());
        events.push(WireEvent::HandshakeComplete(peer));
    }

    // ------------------------------------------------------------------
    // Steady state
    // ------------------------------------------------------------------

    fn read_ready(&mut self, events: &mut Vec<WireEvent>) -> Result<bool> {
        let frame = match Frame::decode(&mut self.inbound, self.framing, self.config.max_frame_size)? {
            Some(f) => f,
            None => return Ok(false),
        };

        if frame.command {
            self.handle_command(Command::decode(&frame.payload)?, events)?;
            return Ok(true);
        }

        self.parts.push(frame.payload);
        if frame.more {
            return Ok(true);
        }

        let message = std::mem::take(&mut self.parts);
        if self.config.socket_type.accepts_subscriptions() {
            self.handle_subscription_message(message, events);
        } else {
            events.push(WireEvent::Message(message));
        }
        Ok(true)
    }

    fn handle_command(&mut self, cmd: Command, events: &mut Vec<WireEvent>) -> Result<()> {
        match cmd.name.as_str() {
            command::SUBSCRIBE | command::CANCEL if self.config.socket_type.accepts_subscriptions() => {
                let topic = cmd.body;
                if cmd.name == command::SUBSCRIBE {
                    self.peer_subscriptions.subscribe(topic.clone());
                    events.push(WireEvent::Subscribed(topic));
                } else {
                    self.peer_subscriptions.cancel(&topic);
                    events.push(WireEvent::Cancelled(topic));
                }
            }
            command::PING => {
                // PING: [ttl:2][context]; PONG echoes the context
                let context = if cmd.body.len() >= 2 {
                    cmd.body.slice(2..)
                } else {
                    Bytes::new()
                };
                self.send_command(Command::new(command::PONG, context))?;
            }
            command::ERROR => {
                return Err(ProtoError::Frame {
                    message: format!("peer sent ERROR: {}", cmd.error_reason()),
                });
            }
            command::READY | command::HELLO | command::WELCOME | command::INITIATE => {
                return Err(ProtoError::Handshake {
                    message: format!("{} after handshake completed", cmd.name),
                });
            }
            other => {
                debug!("Ignoring ZMTP command {}", other);
            }
        }
        Ok(())
    }

    fn handle_subscription_message(&mut self, message: Vec<Bytes>, events: &mut Vec<WireEvent>) {
        let body = match message.as_slice() {
            [single] if !single.is_empty() => single.clone(),
            _ => {
                debug!("Publisher dropped a {}-part inbound message", message.len());
                return;
            }
        };
        let topic = body.slice(1..);
        match body[0] {
            1 => {
                self.peer_subscriptions.subscribe(topic.clone());
                events.push(WireEvent::Subscribed(topic));
            }
            0 => {
                self.peer_subscriptions.cancel(&topic);
                events.push(WireEvent::Cancelled(topic));
            }
            other => debug!("Publisher dropped message with prefix {:#04x}", other),
        }
    }
}

impl fmt::Debug for WireEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireEngine")
            .field("socket_type", &self.config.socket_type)
            .field("stage", &self.stage)
            .field("framing", &self.framing)
            .field("buffered_in", &self.inbound.len())
            .field("buffered_out", &self.outbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAuth;

    impl PlainAuthenticator for FixedAuth {
        fn authenticate(&self, username: &str, password: &str) -> bool {
            username == "admin" && password == "secret"
        }
    }

    /// Shuttle bytes between two engines until both go quiet.
    fn pump(a: &mut WireEngine, b: &mut WireEngine) -> (Vec<WireEvent>, Vec<WireEvent>) {
        let mut events_a = Vec::new();
        let mut events_b = Vec::new();
        for _ in 0..32 {
            let mut moved = false;
            if let Some(bytes) = a.poll_transmit() {
                events_b.extend(b.feed(&bytes).unwrap());
                moved = true;
            }
            if let Some(bytes) = b.poll_transmit() {
                events_a.extend(a.feed(&bytes).unwrap());
                moved = true;
            }
            if !moved {
                break;
            }
        }
        (events_a, events_b)
    }

    fn connected(a: SocketType, b: SocketType) -> (WireEngine, WireEngine) {
        let mut left = WireEngine::new(EngineConfig::new(a).with_identity(Bytes::from_static(b"left")));
        let mut right = WireEngine::new(EngineConfig::new(b));
        let (ea, eb) = pump(&mut left, &mut right);
        assert!(matches!(ea.as_slice(), [WireEvent::HandshakeComplete(_)]));
        assert!(matches!(eb.as_slice(), [WireEvent::HandshakeComplete(_)]));
        (left, right)
    }

    #[test]
    fn test_null_handshake() {
        let (req, rep) = connected(SocketType::Req, SocketType::Rep);
        assert_eq!(req.state(), WireState::Ready);
        assert_eq!(rep.peer().unwrap().socket_type, SocketType::Req);
        assert_eq!(rep.peer().unwrap().identity, Bytes::from_static(b"left"));
        assert_eq!(req.peer().unwrap().generation, PeerGeneration::Current);
    }

    #[test]
    fn test_multipart_message() {
        let (mut req, mut rep) = connected(SocketType::Req, SocketType::Rep);
        req.send_message(&[Bytes::new(), Bytes::from_static(b"{\"jsonrpc\":\"2.0\"}")])
            .unwrap();
        let (_, events) = pump(&mut req, &mut rep);
        match events.as_slice() {
            [WireEvent::Message(parts)] => {
                assert_eq!(parts.len(), 2);
                assert!(parts[0].is_empty());
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let mut req = WireEngine::new(EngineConfig::new(SocketType::Req));
        let mut rep = WireEngine::new(EngineConfig::new(SocketType::Rep));
        let mut events = Vec::new();
        for _ in 0..8 {
            if let Some(bytes) = req.poll_transmit() {
                for b in bytes.iter() {
                    events.extend(rep.feed(&[*b]).unwrap());
                }
            }
            if let Some(bytes) = rep.poll_transmit() {
                req.feed(&bytes).unwrap();
            }
        }
        assert!(rep.is_ready());
        assert!(req.is_ready());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_send_before_ready_rejected() {
        let mut req = WireEngine::new(EngineConfig::new(SocketType::Req));
        assert!(matches!(
            req.send_message(&[Bytes::from_static(b"x")]),
            Err(ProtoError::NotReady { .. })
        ));
    }

    #[test]
    fn test_data_frame_during_handshake_resets() {
        let mut peer = WireEngine::new(EngineConfig::new(SocketType::Req));
        let mut rep = WireEngine::new(EngineConfig::new(SocketType::Rep));

        // Complete the greeting by hand, then inject a data frame instead of READY
        let mut bytes = BytesMut::new();
        greeting::write_preamble(&mut bytes);
        greeting::write_tail(&mut bytes, Mechanism::Null, false);
        Frame::data(Bytes::from_static(b"early"), false)
            .encode(Framing::Current, &mut bytes)
            .unwrap();
        let _ = peer.poll_transmit();

        assert!(matches!(rep.feed(&bytes), Err(ProtoError::PrematureData)));
        assert_eq!(rep.state(), WireState::Closed);
        assert!(matches!(rep.feed(b"more"), Err(ProtoError::Closed)));
    }

    #[test]
    fn test_socket_mismatch_sends_error() {
        let mut req = WireEngine::new(EngineConfig::new(SocketType::Req));
        let mut publisher = WireEngine::new(EngineConfig::new(SocketType::Pub));

        let mut failed = false;
        for _ in 0..8 {
            if let Some(bytes) = req.poll_transmit() {
                if publisher.feed(&bytes).is_err() {
                    failed = true;
                    break;
                }
            }
            if let Some(bytes) = publisher.poll_transmit() {
                if req.feed(&bytes).is_err() {
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed);
        let closed = [req.state(), publisher.state()]
            .iter()
            .filter(|s| **s == WireState::Closed)
            .count();
        assert!(closed >= 1);
    }

    #[test]
    fn test_legacy_peer_downgrade() {
        let mut req = WireEngine::new(EngineConfig::new(SocketType::Req));
        let _ = req.poll_transmit();

        // ZMTP 2.0 REP: signature, revision 1, socket type, empty identity frame
        let mut legacy = vec![0xFF, 0, 0, 0, 0, 0, 0, 0, 1, 0x7F, 0x01, 0x04, 0x00, 0x00];
        let events = req.feed(&legacy).unwrap();
        assert!(matches!(events.as_slice(), [WireEvent::HandshakeComplete(p)] if p.generation == PeerGeneration::Legacy));
        assert_eq!(req.framing(), Framing::Legacy);

        // We answered with our legacy socket type and identity frame
        let reply = req.poll_transmit().unwrap();
        assert_eq!(&reply[..], &[0x03, 0x00, 0x00]);

        // Steady-state frames use the legacy layout
        req.send_message(&[Bytes::from_static(b"hi")]).unwrap();
        assert_eq!(&req.poll_transmit().unwrap()[..], &[0x00, 0x02, b'h', b'i']);

        // Legacy frames from the peer are surfaced
        legacy.clear();
        legacy.extend_from_slice(&[0x01, 0x00, 0x00, 0x02, b'o', b'k']);
        let events = req.feed(&legacy).unwrap();
        assert!(matches!(events.as_slice(), [WireEvent::Message(parts)] if parts.len() == 2));
    }

    #[test]
    fn test_zmtp_1_peer_rejected() {
        let mut rep = WireEngine::new(EngineConfig::new(SocketType::Rep));
        assert!(matches!(rep.feed(&[0x01, 0x00]), Err(ProtoError::Greeting { .. })));
    }

    #[test]
    fn test_plain_mechanism() {
        let mut client = WireEngine::new(
            EngineConfig::new(SocketType::Req).with_credentials("admin", "secret"),
        );
        let mut server = WireEngine::new(
            EngineConfig::new(SocketType::Rep).with_authenticator(Arc::new(FixedAuth)),
        );
        let (ec, es) = pump(&mut client, &mut server);
        assert!(client.is_ready());
        assert!(server.is_ready());
        assert_eq!(ec.len(), 1);
        match es.as_slice() {
            [WireEvent::HandshakeComplete(peer)] => {
                assert_eq!(peer.username.as_deref(), Some("admin"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plain_mechanism_rejects_bad_password() {
        let mut client = WireEngine::new(
            EngineConfig::new(SocketType::Req).with_credentials("admin", "wrong"),
        );
        let mut server = WireEngine::new(
            EngineConfig::new(SocketType::Rep).with_authenticator(Arc::new(FixedAuth)),
        );

        let mut server_err = None;
        let mut client_err = None;
        for _ in 0..8 {
            if let Some(bytes) = client.poll_transmit() {
                if let Err(e) = server.feed(&bytes) {
                    server_err = Some(e);
                }
            }
            if let Some(bytes) = server.poll_transmit() {
                if let Err(e) = client.feed(&bytes) {
                    client_err = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(server_err, Some(ProtoError::AuthRejected { .. })));
        assert!(matches!(client_err, Some(ProtoError::AuthRejected { .. })));
    }

    #[test]
    fn test_subscribe_command_updates_publisher() {
        let (mut sub, mut publisher) = connected(SocketType::Sub, SocketType::Pub);
        sub.subscribe(b"A").unwrap();
        let (_, events) = pump(&mut sub, &mut publisher);
        assert_eq!(events, vec![WireEvent::Subscribed(Bytes::from_static(b"A"))]);
        assert!(publisher.peer_subscriptions().matches(b"AB"));

        sub.cancel(b"A").unwrap();
        pump(&mut sub, &mut publisher);
        assert!(publisher.peer_subscriptions().is_empty());
    }

    #[test]
    fn test_message_form_subscription() {
        let (mut sub, mut publisher) = connected(SocketType::Sub, SocketType::Pub);
        // A ZMTP 3.0 style subscription message
        sub.send_message(&[Bytes::from_static(b"\x01news")]).unwrap();
        let (_, events) = pump(&mut sub, &mut publisher);
        assert_eq!(events, vec![WireEvent::Subscribed(Bytes::from_static(b"news"))]);
        assert!(publisher.peer_subscriptions().contains(b"news"));
    }

    #[test]
    fn test_second_ready_rejected() {
        let (mut req, mut rep) = connected(SocketType::Req, SocketType::Rep);
        let ready = HandshakeCommand::ready(req.local_properties()).to_command().unwrap();
        req.send_command(ready).unwrap();
        let bytes = req.poll_transmit().unwrap();
        assert!(matches!(rep.feed(&bytes), Err(ProtoError::Handshake { .. })));
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (mut req, mut rep) = connected(SocketType::Req, SocketType::Rep);
        req.send_command(Command::new(command::PING, Bytes::from_static(b"\x00\x0actx")))
            .unwrap();
        let bytes = req.poll_transmit().unwrap();
        assert!(rep.feed(&bytes).unwrap().is_empty());

        let pong = rep.poll_transmit().unwrap();
        let mut buf = BytesMut::from(&pong[..]);
        let frame = Frame::decode(&mut buf, Framing::Current, 1024).unwrap().unwrap();
        let cmd = Command::decode(&frame.payload).unwrap();
        assert!(cmd.is(command::PONG));
        assert_eq!(&cmd.body[..], b"ctx");
    }
}
