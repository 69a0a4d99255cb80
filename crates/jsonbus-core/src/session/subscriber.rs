//! Subscriber role: receives publications whose topic matches a prefix.

use super::client::{retry_policy, spawn_driver, wait_blocking, ClientCore, LinkHandler};
use super::state::{Role, SessionState};
use crate::config::{BusConfig, BusOptions};
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::transport::{LinkCommand, LinkEvent, Transport};
use bytes::Bytes;
use jsonbus_proto::{codec, Message, SubscriptionSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// One message received on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: Bytes,
    pub message: Message,
}

impl Publication {
    /// Topic as text, if it is valid UTF-8.
    pub fn topic_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.topic).ok()
    }
}

type Topics = Arc<Mutex<SubscriptionSet>>;

fn lock(topics: &Topics) -> MutexGuard<'_, SubscriptionSet> {
    topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Client handle for topic subscriptions.
///
/// The subscription set lives here and is replayed on every reconnect.
/// Publications are filtered again locally, so a publisher that ignores
/// subscriptions still only delivers matching topics.
pub struct Subscriber {
    core: Arc<ClientCore>,
    topics: Topics,
    inbox: Arc<tokio::sync::Mutex<mpsc::Receiver<Publication>>>,
    runtime: Handle,
}

impl Subscriber {
    pub(crate) fn start(
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        options: &BusOptions,
        runtime: Handle,
        session_id: String,
    ) -> Self {
        let retry = retry_policy(&endpoint, &options.retry);

        let mut initial = SubscriptionSet::new();
        for topic in &endpoint.options().topics {
            initial.subscribe(Bytes::from(topic.clone().into_bytes()));
        }
        let topics = Arc::new(Mutex::new(initial));

        let (tx, rx) = mpsc::channel(BusConfig::SUBSCRIBER_QUEUE);
        let core = Arc::new(ClientCore::new(endpoint, Role::Subscriber, session_id));
        let handler = Arc::new(Inbox {
            topics: topics.clone(),
            tx,
        });
        spawn_driver(&runtime, core.clone(), transport, options.security.clone(), retry, handler);

        Self {
            core,
            topics,
            inbox: Arc::new(tokio::sync::Mutex::new(rx)),
            runtime,
        }
    }

    pub fn uri(&self) -> &str {
        self.core.endpoint.uri()
    }

    pub fn role(&self) -> Role {
        Role::Subscriber
    }

    pub fn state(&self) -> SessionState {
        self.core.state.get()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.core.state.subscribe()
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        self.core.state.wait_ready(timeout).await
    }

    /// Add a topic prefix. The empty prefix matches everything.
    ///
    /// Takes effect on the live connection at once, and on later
    /// connections when they come up.
    pub fn subscribe(&self, topic: impl AsRef<[u8]>) -> Result<()> {
        if self.core.is_closed() {
            return Err(BusError::Closed);
        }
        let topic = Bytes::copy_from_slice(topic.as_ref());
        if lock(&self.topics).subscribe(topic.clone()) {
            self.core.send_if_connected(LinkCommand::Subscribe(topic));
        }
        Ok(())
    }

    pub fn unsubscribe(&self, topic: impl AsRef<[u8]>) -> Result<()> {
        if self.core.is_closed() {
            return Err(BusError::Closed);
        }
        let topic = topic.as_ref();
        if lock(&self.topics).cancel(topic) {
            self.core
                .send_if_connected(LinkCommand::Cancel(Bytes::copy_from_slice(topic)));
        }
        Ok(())
    }

    pub fn topics(&self) -> Vec<Bytes> {
        lock(&self.topics).topics().cloned().collect()
    }

    /// Next publication; fails with `Closed` once the session is gone.
    pub async fn recv(&self) -> Result<Publication> {
        next(&self.inbox).await
    }

    pub async fn read_with_timeout(&self, timeout: Duration) -> Result<Publication> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    /// Blocking variant of [`read_with_timeout`](Self::read_with_timeout);
    /// call it from a thread outside any tokio runtime.
    pub fn recv_blocking(&self, timeout: Duration) -> Result<Publication> {
        let inbox = self.inbox.clone();
        wait_blocking(&self.runtime, timeout, async move {
            match tokio::time::timeout(timeout, next(&inbox)).await {
                Ok(result) => result,
                Err(_) => Err(BusError::Timeout(timeout)),
            }
        })
    }

    /// Close the session. Further calls are no-ops.
    pub fn close(&self) {
        if self.core.close() {
            debug!("Subscriber {} closed", self.core.session_id);
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

async fn next(inbox: &tokio::sync::Mutex<mpsc::Receiver<Publication>>) -> Result<Publication> {
    inbox.lock().await.recv().await.ok_or(BusError::Closed)
}

/// Filters publications from the link into the subscriber's queue.
struct Inbox {
    topics: Topics,
    tx: mpsc::Sender<Publication>,
}

impl Inbox {
    fn deliver(&self, topic: Bytes, payload: &[u8]) {
        if !lock(&self.topics).matches(&topic) {
            debug!("Dropping publication on unsubscribed topic {:?}", topic);
            return;
        }
        let Ok(text) = std::str::from_utf8(payload) else {
            warn!("Dropping non-UTF-8 publication on {:?}", topic);
            return;
        };

        for message in codec::decode(text) {
            let publication = Publication {
                topic: topic.clone(),
                message,
            };
            match self.tx.try_send(publication) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Subscriber queue full, dropping publication on {:?}", topic);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }
}

impl LinkHandler for Inbox {
    fn initial_commands(&self) -> Vec<LinkCommand> {
        lock(&self.topics)
            .topics()
            .cloned()
            .map(LinkCommand::Subscribe)
            .collect()
    }

    fn on_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Publication { topic, payload } => self.deliver(topic, &payload),
            LinkEvent::Text(_) => debug!("Subscriber ignores JSON-RPC text"),
            LinkEvent::Failed(reason) => warn!("Subscriber link error: {}", reason),
            LinkEvent::Closed(_) => {}
        }
    }

    fn on_disconnected(&self, reason: &str) {
        debug!("Subscriber link down: {}", reason);
    }
}
