//! Reconnect controller for client roles.
//!
//! A background task owns the transport link. It connects with bounded
//! retries, publishes `Ready`, forwards link events to the role's
//! [`LinkHandler`], and on loss moves to `Reconnecting` and starts over.
//! Exhausting the retries or closing the session ends in `Closed`.

use super::state::{Role, SessionState, StateCell};
use crate::config::BusConfig;
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::retry::{retry_async, RetryConfig};
use crate::security::SecurityProvider;
use crate::transport::{shutdown_signal, LinkCommand, LinkEvent, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

/// Role-specific reaction to link activity.
pub(crate) trait LinkHandler: Send + Sync + 'static {
    /// Commands to replay on every fresh link before the session turns
    /// `Ready`. The link is already installed when this is called.
    fn initial_commands(&self) -> Vec<LinkCommand> {
        Vec::new()
    }

    fn on_event(&self, event: LinkEvent);

    /// The link is gone (lost, reopened or closed).
    fn on_disconnected(&self, reason: &str);
}

/// State shared between a client handle and its driver task.
pub(crate) struct ClientCore {
    pub endpoint: Endpoint,
    pub role: Role,
    pub session_id: String,
    pub state: StateCell,
    link: Mutex<Option<mpsc::Sender<LinkCommand>>>,
    reopen: Notify,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl ClientCore {
    pub fn new(endpoint: Endpoint, role: Role, session_id: String) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            endpoint,
            role,
            session_id,
            state: StateCell::new(SessionState::Connecting),
            link: Mutex::new(None),
            reopen: Notify::new(),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    fn link(&self) -> MutexGuard<'_, Option<mpsc::Sender<LinkCommand>>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand a command to the live link without waiting.
    ///
    /// Fails with `TransportNotReady` unless the session is `Ready`.
    pub fn try_send(&self, command: LinkCommand) -> Result<()> {
        self.state.ensure_ready()?;
        let sender = self.link().clone().ok_or(BusError::TransportNotReady {
            state: self.state.get(),
        })?;
        sender.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BusError::transport("link queue is full"),
            mpsc::error::TrySendError::Closed(_) => BusError::TransportNotReady {
                state: self.state.get(),
            },
        })
    }

    /// Like [`try_send`](Self::try_send), but a missing link is not an error.
    pub fn send_if_connected(&self, command: LinkCommand) {
        if let Some(sender) = self.link().clone() {
            let _ = sender.try_send(command);
        }
    }

    /// Detach the live link at once; the driver reconnects.
    pub fn request_reopen(&self) {
        *self.link() = None;
        self.state.set(SessionState::Reconnecting);
        self.reopen.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the driver. Returns `false` if the session was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        self.state.set(SessionState::Closed);
        true
    }
}

/// Run `work` on `runtime` and block the calling thread for its outcome.
///
/// Refuses to run on a runtime thread, where blocking would stall the
/// tasks the outcome depends on. Gives up `BLOCKING_MARGIN` after
/// `timeout` even if the runtime never answers.
pub(crate) fn wait_blocking<T, F>(runtime: &Handle, timeout: Duration, work: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    ensure_off_runtime()?;
    let (tx, rx) = std::sync::mpsc::channel();
    runtime.spawn(async move {
        let _ = tx.send(work.await);
    });
    match rx.recv_timeout(timeout + BusConfig::BLOCKING_MARGIN) {
        Ok(outcome) => outcome,
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(BusError::Timeout(timeout)),
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
            Err(BusError::transport("runtime stopped before the wait finished"))
        }
    }
}

/// Blocking helpers must be called from a thread outside any runtime.
pub(crate) fn ensure_off_runtime() -> Result<()> {
    if Handle::try_current().is_ok() {
        return Err(BusError::transport(
            "blocking call made from a runtime thread; use the async variant",
        ));
    }
    Ok(())
}

/// Retry policy for one endpoint: the `retries` option overrides the
/// bus-wide attempt count.
pub(crate) fn retry_policy(endpoint: &Endpoint, base: &RetryConfig) -> RetryConfig {
    match endpoint.options().retries {
        Some(attempts) => base.clone().with_max_attempts(attempts),
        None => base.clone(),
    }
}

/// Start the reconnect controller for `core`.
pub(crate) fn spawn_driver(
    runtime: &Handle,
    core: Arc<ClientCore>,
    transport: Arc<dyn Transport>,
    security: Arc<dyn SecurityProvider>,
    retry: RetryConfig,
    handler: Arc<dyn LinkHandler>,
) -> tokio::task::JoinHandle<()> {
    runtime.spawn(drive(core, transport, security, retry, handler))
}

async fn drive(
    core: Arc<ClientCore>,
    transport: Arc<dyn Transport>,
    security: Arc<dyn SecurityProvider>,
    retry: RetryConfig,
    handler: Arc<dyn LinkHandler>,
) {
    let shutdown = core.shutdown.subscribe();
    let label = format!("{} {} [{}]", core.role, core.endpoint, core.session_id);

    'session: loop {
        let connect = retry_async(
            &retry,
            || transport.connect(&core.endpoint, core.role, security.clone()),
            BusError::is_retryable,
        );
        let (result, attempts) = tokio::select! {
            outcome = connect => outcome,
            _ = core.reopen.notified() => {
                debug!("{}: reopen while connecting, starting over", label);
                continue 'session;
            }
            _ = shutdown_signal(shutdown.clone()) => break 'session,
        };

        let mut link = match result {
            Ok(link) => link,
            Err(e) => {
                error!("{}: giving up after {} attempts: {}", label, attempts, e);
                break 'session;
            }
        };

        // Install the link before taking the replay snapshot, so a command
        // issued meanwhile reaches the link directly or lands in the snapshot.
        let commands = link.sender();
        *core.link() = Some(commands.clone());
        for command in handler.initial_commands() {
            if commands.send(command).await.is_err() {
                break;
            }
        }
        core.state.set(SessionState::Ready);
        info!("{}: ready", label);

        let (reason, reopened) = loop {
            tokio::select! {
                _ = shutdown_signal(shutdown.clone()) => {
                    link.close();
                    break 'session;
                }
                _ = core.reopen.notified() => {
                    link.close();
                    break ("reopen requested".to_string(), true);
                }
                event = link.next_event() => match event {
                    Some(LinkEvent::Closed(reason)) => break (reason, false),
                    None => break ("link task ended".to_string(), false),
                    Some(event) => handler.on_event(event),
                }
            }
        };

        *core.link() = None;
        handler.on_disconnected(&reason);
        if core.is_closed() {
            break 'session;
        }
        core.state.set(SessionState::Reconnecting);

        if reopened {
            debug!("{}: reopening", label);
            continue 'session;
        }

        warn!("{}: connection lost ({}), reconnecting", label, reason);
        tokio::select! {
            _ = tokio::time::sleep(retry.base_delay) => {}
            _ = core.reopen.notified() => {}
            _ = shutdown_signal(shutdown.clone()) => break 'session,
        }
    }

    *core.link() = None;
    handler.on_disconnected("session closed");
    core.state.set(SessionState::Closed);
    debug!("{}: driver stopped", label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::PlainSecurity;
    use crate::transport::BinaryTransport;
    use std::time::Duration;

    struct Quiet;

    impl LinkHandler for Quiet {
        fn on_event(&self, _event: LinkEvent) {}
        fn on_disconnected(&self, _reason: &str) {}
    }

    /// Records whether the core already had a link when the replay
    /// snapshot was taken.
    struct SnapshotWatcher {
        core: Mutex<Option<Arc<ClientCore>>>,
        saw_link: Mutex<Vec<bool>>,
    }

    impl LinkHandler for SnapshotWatcher {
        fn initial_commands(&self) -> Vec<LinkCommand> {
            if let Some(core) = self.core.lock().unwrap().as_ref() {
                self.saw_link.lock().unwrap().push(core.link().is_some());
            }
            Vec::new()
        }
        fn on_event(&self, _event: LinkEvent) {}
        fn on_disconnected(&self, _reason: &str) {}
    }

    #[tokio::test]
    async fn test_link_installed_before_replay_snapshot() {
        use crate::config::BusOptions;
        use crate::dispatch::MethodTable;
        use crate::session::Responder;

        let options = BusOptions::default();
        let responder = Responder::start(
            Endpoint::parse("tcp://127.0.0.1:0").unwrap(),
            Arc::new(BinaryTransport),
            &options,
            Arc::new(MethodTable::empty()),
            "r".to_string(),
        )
        .await
        .unwrap();
        let addr = responder.local_addr();

        let endpoint = Endpoint::parse(&format!("tcp://{}", addr)).unwrap();
        let core = Arc::new(ClientCore::new(endpoint, Role::Requester, "t".to_string()));
        let handler = Arc::new(SnapshotWatcher {
            core: Mutex::new(Some(core.clone())),
            saw_link: Mutex::new(Vec::new()),
        });
        let _task = spawn_driver(
            &Handle::current(),
            core.clone(),
            Arc::new(BinaryTransport),
            Arc::new(PlainSecurity),
            RetryConfig::fixed(5, Duration::from_millis(10)),
            handler.clone(),
        );

        core.state.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(*handler.saw_link.lock().unwrap(), vec![true]);

        core.close();
        responder.close();
    }

    #[test]
    fn test_retries_option_overrides_attempts() {
        let base = RetryConfig::fixed(5, Duration::from_millis(10));
        let endpoint = Endpoint::parse("tcp://127.0.0.1:5555?retries=2").unwrap();
        assert_eq!(retry_policy(&endpoint, &base).max_attempts, 2);

        let endpoint = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(retry_policy(&endpoint, &base).max_attempts, 5);
    }

    #[tokio::test]
    async fn test_wait_blocking_refuses_runtime_thread() {
        let result = wait_blocking(&Handle::current(), Duration::from_secs(5), async { Ok(1) });
        assert!(matches!(result, Err(BusError::Transport { .. })));
    }

    #[test]
    fn test_wait_blocking_from_plain_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();

        let value = wait_blocking(&handle, Duration::from_secs(5), async { Ok(7) }).unwrap();
        assert_eq!(value, 7);

        // Work that outlives its timeout plus the margin is abandoned.
        let started = std::time::Instant::now();
        let result: Result<()> = wait_blocking(&handle, Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        assert!(matches!(result, Err(BusError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unreachable_peer_ends_closed() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:1").unwrap();
        let core = Arc::new(ClientCore::new(endpoint, Role::Requester, "t".to_string()));
        assert!(matches!(
            core.try_send(LinkCommand::Close),
            Err(BusError::TransportNotReady { .. })
        ));

        let retry = RetryConfig::fixed(2, Duration::from_millis(5));
        let task = spawn_driver(
            &Handle::current(),
            core.clone(),
            Arc::new(BinaryTransport),
            Arc::new(PlainSecurity),
            retry,
            Arc::new(Quiet),
        );
        task.await.unwrap();
        assert_eq!(core.state.get(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_driver() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:1").unwrap();
        let core = Arc::new(ClientCore::new(endpoint, Role::Subscriber, "t".to_string()));
        let retry = RetryConfig::fixed(1000, Duration::from_millis(50));
        let task = spawn_driver(
            &Handle::current(),
            core.clone(),
            Arc::new(BinaryTransport),
            Arc::new(PlainSecurity),
            retry,
            Arc::new(Quiet),
        );

        assert!(core.close());
        assert!(!core.close());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(core.state.get(), SessionState::Closed);
    }
}
