//! Connected-peer registry for server sessions.
//!
//! Each accepted connection gets an outbound queue and a subscription set.
//! Connections are added and removed while publications are being fanned
//! out; a peer whose queue is full or closed is dropped on the spot and the
//! broadcast continues with the others.

use crate::dispatch::{PeerContext, PeerId};
use crate::error::{BusError, Result};
use bytes::Bytes;
use jsonbus_proto::SubscriptionSet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Something a server connection task should write to its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFrame {
    Publication { topic: Bytes, payload: Bytes },
}

struct PeerEntry {
    context: PeerContext,
    tx: mpsc::Sender<PeerFrame>,
    subscriptions: SubscriptionSet,
}

/// Registry of the peers connected to one listener.
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    next_id: AtomicU64,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_peers,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PeerId, PeerEntry>> {
        self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PeerId, PeerEntry>> {
        self.peers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a peer and hand back its context and outbound queue.
    pub fn register(
        &self,
        addr: Option<SocketAddr>,
        user: Option<String>,
        queue: usize,
    ) -> Result<(PeerContext, mpsc::Receiver<PeerFrame>)> {
        let mut peers = self.write();
        if peers.len() >= self.max_peers {
            return Err(BusError::transport(format!(
                "peer limit reached ({})",
                self.max_peers
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(queue);
        let context = PeerContext { id, addr, user };
        peers.insert(
            id,
            PeerEntry {
                context: context.clone(),
                tx,
                subscriptions: SubscriptionSet::new(),
            },
        );
        debug!("Registered peer {} ({:?})", id, addr);
        Ok((context, rx))
    }

    pub fn remove(&self, id: PeerId) {
        if self.write().remove(&id).is_some() {
            debug!("Removed peer {}", id);
        }
    }

    pub fn subscribe(&self, id: PeerId, topic: Bytes) {
        if let Some(entry) = self.write().get_mut(&id) {
            entry.subscriptions.subscribe(topic);
        }
    }

    pub fn cancel(&self, id: PeerId, topic: &[u8]) {
        if let Some(entry) = self.write().get_mut(&id) {
            entry.subscriptions.cancel(topic);
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn peers(&self) -> Vec<PeerContext> {
        self.read().values().map(|e| e.context.clone()).collect()
    }

    /// Number of peers whose subscriptions match `topic`.
    pub fn subscriber_count(&self, topic: &[u8]) -> usize {
        self.read()
            .values()
            .filter(|e| e.subscriptions.matches(topic))
            .count()
    }

    /// Queue a publication for every peer subscribed to `topic`.
    ///
    /// Returns how many peers it was queued for.
    pub fn broadcast(&self, topic: &[u8], payload: Bytes) -> usize {
        let topic = Bytes::copy_from_slice(topic);
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, entry) in self.read().iter() {
            if !entry.subscriptions.matches(&topic) {
                continue;
            }
            let frame = PeerFrame::Publication {
                topic: topic.clone(),
                payload: payload.clone(),
            };
            match entry.tx.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Peer {} is not keeping up, dropping it", id);
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }

        if !dead.is_empty() {
            let mut peers = self.write();
            for id in dead {
                peers.remove(&id);
            }
        }
        delivered
    }

    /// Drop every peer; their connection tasks see a closed queue.
    pub fn clear(&self) {
        self.write().clear();
    }
}
