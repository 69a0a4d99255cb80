//! Session roles and lifecycle state.

use crate::error::{BusError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The four session roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Requester,
    Responder,
    Publisher,
    Subscriber,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Requester,
        Role::Responder,
        Role::Publisher,
        Role::Subscriber,
    ];

    /// Client roles connect out and are supervised by the reconnect loop.
    pub fn is_client(&self) -> bool {
        matches!(self, Role::Requester | Role::Subscriber)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Requester => "Requester",
            Role::Responder => "Responder",
            Role::Publisher => "Publisher",
            Role::Subscriber => "Subscriber",
        };
        f.write_str(name)
    }
}

/// Connection lifecycle: `Connecting → Ready → {Reconnecting | Closed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Observable session state shared between a handle and its I/O task.
#[derive(Debug, Clone)]
pub struct StateCell {
    tx: Arc<watch::Sender<SessionState>>,
}

impl StateCell {
    pub fn new(initial: SessionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Move to `next`. `Closed` is terminal and never left.
    pub fn set(&self, next: SessionState) {
        self.tx.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Fail fast unless the session is `Ready`.
    pub fn ensure_ready(&self) -> Result<()> {
        match self.get() {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(BusError::Closed),
            state => Err(BusError::TransportNotReady { state }),
        }
    }

    /// Wait until the session is `Ready`.
    ///
    /// Fails with `Closed` if the session gives up, or `Timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed)),
        )
        .await;

        match waited {
            Ok(Ok(state)) if *state == SessionState::Ready => Ok(()),
            Ok(_) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_is_terminal() {
        let cell = StateCell::new(SessionState::Connecting);
        cell.set(SessionState::Ready);
        assert_eq!(cell.get(), SessionState::Ready);
        cell.set(SessionState::Closed);
        cell.set(SessionState::Reconnecting);
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn test_ensure_ready() {
        let cell = StateCell::new(SessionState::Connecting);
        assert!(matches!(
            cell.ensure_ready(),
            Err(BusError::TransportNotReady {
                state: SessionState::Connecting
            })
        ));
        cell.set(SessionState::Closed);
        assert!(matches!(cell.ensure_ready(), Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let cell = StateCell::new(SessionState::Connecting);
        let setter = cell.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.set(SessionState::Ready);
        });
        cell.wait_ready(Duration::from_secs(1)).await.unwrap();

        let idle = StateCell::new(SessionState::Connecting);
        assert!(matches!(
            idle.wait_ready(Duration::from_millis(20)).await,
            Err(BusError::Timeout(_))
        ));
    }
}
