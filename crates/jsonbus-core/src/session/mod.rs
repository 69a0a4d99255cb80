//! Sessions: one handle per role.
//!
//! Client roles ([`Requester`], [`Subscriber`]) come back immediately in
//! `Connecting` and are kept connected by a background reconnect
//! controller. Server roles ([`Responder`], [`Publisher`]) are `Ready` as
//! soon as their listener is bound.

mod client;
mod publisher;
mod requester;
mod responder;
mod server;
mod state;
mod subscriber;

pub use publisher::Publisher;
pub use requester::Requester;
pub use responder::Responder;
pub use state::{Role, SessionState, StateCell};
pub use subscriber::{Publication, Subscriber};

use std::net::SocketAddr;

/// A session of any role.
pub enum Session {
    Requester(Requester),
    Responder(Responder),
    Publisher(Publisher),
    Subscriber(Subscriber),
}

impl Session {
    pub fn role(&self) -> Role {
        match self {
            Session::Requester(_) => Role::Requester,
            Session::Responder(_) => Role::Responder,
            Session::Publisher(_) => Role::Publisher,
            Session::Subscriber(_) => Role::Subscriber,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            Session::Requester(s) => s.uri(),
            Session::Responder(s) => s.uri(),
            Session::Publisher(s) => s.uri(),
            Session::Subscriber(s) => s.uri(),
        }
    }

    pub fn state(&self) -> SessionState {
        match self {
            Session::Requester(s) => s.state(),
            Session::Responder(s) => s.state(),
            Session::Publisher(s) => s.state(),
            Session::Subscriber(s) => s.state(),
        }
    }

    /// Bound address of a server session.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Session::Responder(s) => Some(s.local_addr()),
            Session::Publisher(s) => Some(s.local_addr()),
            Session::Requester(_) | Session::Subscriber(_) => None,
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        match self {
            Session::Requester(s) => s.close(),
            Session::Responder(s) => s.close(),
            Session::Publisher(s) => s.close(),
            Session::Subscriber(s) => s.close(),
        }
    }

    pub fn into_requester(self) -> Option<Requester> {
        match self {
            Session::Requester(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_responder(self) -> Option<Responder> {
        match self {
            Session::Responder(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_publisher(self) -> Option<Publisher> {
        match self {
            Session::Publisher(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_subscriber(self) -> Option<Subscriber> {
        match self {
            Session::Subscriber(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role())
            .field("uri", &self.uri())
            .field("state", &self.state())
            .finish()
    }
}
