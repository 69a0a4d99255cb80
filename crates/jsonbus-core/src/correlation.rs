//! Reply correlation for one Requester connection.
//!
//! A connection holds at most one pending request. The slot is a
//! mutex-guarded `Option`, so the caller registering a request and the I/O
//! task delivering its reply never race. A second send while the slot is
//! taken is rejected with [`BusError::RequestPending`].

use crate::error::{BusError, Result};
use jsonbus_proto::{Id, Reply};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type ReplySender = oneshot::Sender<Result<Reply>>;

struct PendingRequest {
    token: u64,
    id: Id,
    created_at: Instant,
    tx: ReplySender,
}

/// Single-slot table of the request awaiting its reply.
#[derive(Default)]
pub struct Correlator {
    slot: Mutex<Option<PendingRequest>>,
    next_token: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingRequest>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot for `id`.
    pub fn register(self: &Arc<Self>, id: Id) -> Result<ReplyFuture> {
        let mut slot = self.lock();
        if let Some(pending) = slot.as_ref() {
            return Err(BusError::RequestPending {
                id: pending.id.clone(),
            });
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        *slot = Some(PendingRequest {
            token,
            id: id.clone(),
            created_at: Instant::now(),
            tx,
        });

        Ok(ReplyFuture {
            id,
            token,
            rx,
            correlator: Arc::clone(self),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.lock().is_some()
    }

    /// Deliver a reply. Returns `false` when it was discarded.
    ///
    /// A reply without an id answers the in-flight request (the peer could
    /// not read our id); any other mismatch leaves the slot untouched.
    pub fn resolve(&self, id: Option<&Id>, outcome: Result<Reply>) -> bool {
        let mut slot = self.lock();
        let matches = match (slot.as_ref(), id) {
            (Some(pending), Some(id)) => &pending.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if !matches {
            match slot.as_ref() {
                Some(pending) => warn!(
                    "Discarding reply for {:?}: awaiting {}",
                    id.map(ToString::to_string),
                    pending.id
                ),
                None => warn!(
                    "Discarding reply for {:?}: no request pending",
                    id.map(ToString::to_string)
                ),
            }
            return false;
        }

        match slot.take() {
            Some(pending) => {
                debug!(
                    "Reply for {} after {:?}",
                    pending.id,
                    pending.created_at.elapsed()
                );
                // The caller may have stopped waiting; that's fine
                let _ = pending.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail whatever is in flight, e.g. on connection loss.
    pub fn fail(&self, err: BusError) {
        if let Some(pending) = self.lock().take() {
            debug!("Failing pending request {}: {}", pending.id, err);
            let _ = pending.tx.send(Err(err));
        }
    }

    fn cancel(&self, token: u64) {
        let mut slot = self.lock();
        if slot.as_ref().map(|p| p.token) == Some(token) {
            *slot = None;
        }
    }
}

/// Resolves to the reply of one request.
///
/// Dropping the future (directly or through a timeout) frees the
/// connection's slot; a reply arriving later is discarded.
pub struct ReplyFuture {
    id: Id,
    token: u64,
    rx: oneshot::Receiver<Result<Reply>>,
    correlator: Arc<Correlator>,
}

impl ReplyFuture {
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Await the reply for at most `timeout`.
    pub async fn with_timeout(self, timeout: Duration) -> Result<Reply> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

impl Future for ReplyFuture {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BusError::transport("reply channel dropped"))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ReplyFuture {
    fn drop(&mut self) {
        self.correlator.cancel(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_matching_reply() {
        let correlator = Arc::new(Correlator::new());
        let fut = correlator.register(Id::from(1)).unwrap();
        assert!(correlator.is_pending());

        assert!(correlator.resolve(Some(&Id::from(1)), Ok(Reply::success(1, json!(19)))));
        let reply = fut.await.unwrap();
        assert_eq!(reply.result(), Some(&json!(19)));
        assert!(!correlator.is_pending());
    }

    #[test]
    fn test_second_register_rejected() {
        let correlator = Arc::new(Correlator::new());
        let _first = correlator.register(Id::from(1)).unwrap();
        match correlator.register(Id::from(2)) {
            Err(BusError::RequestPending { id }) => assert_eq!(id, Id::from(1)),
            other => panic!("expected RequestPending, got {:?}", other.map(|f| f.id().clone())),
        }
    }

    #[tokio::test]
    async fn test_mismatched_reply_discarded() {
        let correlator = Arc::new(Correlator::new());
        let fut = correlator.register(Id::from(1)).unwrap();

        assert!(!correlator.resolve(Some(&Id::from(7)), Ok(Reply::success(7, json!(0)))));
        assert!(correlator.is_pending());

        correlator.resolve(Some(&Id::from(1)), Ok(Reply::success(1, json!(1))));
        assert!(fut.await.is_ok());
    }

    #[test]
    fn test_reply_without_pending_discarded() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(Some(&Id::from(1)), Ok(Reply::success(1, json!(0)))));
    }

    #[tokio::test]
    async fn test_timeout_frees_slot() {
        let correlator = Arc::new(Correlator::new());
        let fut = correlator.register(Id::from(1)).unwrap();
        let result = fut.with_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(BusError::Timeout(_))));
        assert!(!correlator.is_pending());

        // Late reply finds nothing to resolve
        assert!(!correlator.resolve(Some(&Id::from(1)), Ok(Reply::success(1, json!(0)))));
        assert!(correlator.register(Id::from(2)).is_ok());
    }

    #[tokio::test]
    async fn test_fail_on_disconnect() {
        let correlator = Arc::new(Correlator::new());
        let fut = correlator.register(Id::from(3)).unwrap();
        correlator.fail(BusError::transport("connection lost"));
        assert!(matches!(fut.await, Err(BusError::Transport { .. })));
    }
}
