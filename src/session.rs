//! Coordination Session
//!
//! Owns one session on the coordination store and runs its notification
//! dispatcher. Session lifecycle events drive the session state machine
//! (`Connecting -> Connected -> Disconnected`); node events are handed to
//! the registered watchers one at a time, in delivery order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use crate::error::{Error, Result};
use crate::store::{CoordinationStore, EventReceiver, RemoteStore, StoreEvent};

/// How long `close()` waits for the dispatcher to record the disconnect
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Why a session reached `Disconnected`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    /// `close()` was called
    Closed,
    /// Connection to the store was lost
    ConnectionLost,
    /// The store expired the session
    Expired,
    /// A watcher failed to handle a notification; the session was closed
    WatcherFailed(String),
}

/// Receives notifications delivered on the session
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Handle one event. An error means the watcher could not re-arm and
    /// the session must not carry on as if it were still watching.
    async fn process(&self, event: &StoreEvent) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Status {
    state: SessionState,
    reason: Option<DisconnectReason>,
}

/// A session on the coordination store
pub struct CoordinationSession {
    store: Arc<dyn CoordinationStore>,
    status: watch::Sender<Status>,
    watchers: RwLock<Vec<Arc<dyn Watcher>>>,
    /// Set by `close()` before the store session is released
    closing: AtomicBool,
}

impl CoordinationSession {
    /// Connect to a store server and wait until the session is established
    pub async fn connect(address: &str, session_timeout: Duration, connect_timeout: Duration) -> Result<Arc<Self>> {
        let (store, events) = RemoteStore::connect(address, session_timeout, connect_timeout).await?;
        let session = Self::start(store, events);

        if let Err(e) = session.wait_connected(connect_timeout).await {
            let _ = session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Wrap an already-opened store session and start dispatching its events
    pub fn start(store: Arc<dyn CoordinationStore>, events: EventReceiver) -> Arc<Self> {
        let (status, _) = watch::channel(Status {
            state: SessionState::Connecting,
            reason: None,
        });
        let session = Arc::new(Self {
            store,
            status,
            watchers: RwLock::new(Vec::new()),
            closing: AtomicBool::new(false),
        });

        tokio::spawn(Self::dispatch(Arc::downgrade(&session), events));
        session
    }

    /// Store handle bound to this session
    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        Arc::clone(&self.store)
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Reason for disconnect, once disconnected
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.status.borrow().reason.clone()
    }

    /// Register a watcher for every subsequent notification
    pub async fn add_watcher(&self, watcher: Arc<dyn Watcher>) {
        self.watchers.write().await.push(watcher);
    }

    /// Wait for the store to confirm the session
    pub async fn wait_connected(&self, limit: Duration) -> Result<()> {
        let mut rx = self.status.subscribe();
        let waited = tokio::time::timeout(limit, rx.wait_for(|s| s.state != SessionState::Connecting)).await;
        match waited {
            Ok(Ok(status)) if status.state == SessionState::Connected => Ok(()),
            Ok(_) => Err(Error::ConnectionLoss),
            Err(_) => Err(Error::ConnectionTimeout(format!("session {}", self.store.session_id()))),
        }
    }

    /// Block until the session is disconnected or expires.
    ///
    /// A watcher failure surfaces here as `Error::WatchRearm`.
    pub async fn await_disconnect(&self) -> Result<DisconnectReason> {
        let mut rx = self.status.subscribe();
        let reason = {
            let status = rx
                .wait_for(|s| s.state == SessionState::Disconnected)
                .await
                .map_err(|_| Error::Internal("session status channel closed".into()))?;
            status.reason.clone().unwrap_or(DisconnectReason::ConnectionLost)
        };

        match reason {
            DisconnectReason::WatcherFailed(msg) => Err(Error::WatchRearm(msg)),
            other => Ok(other),
        }
    }

    /// Release the session. The store deletes its ephemeral nodes.
    ///
    /// Watchers hear `Disconnected` from the dispatcher before this returns,
    /// unless the dispatcher does not finish within `CLOSE_GRACE`.
    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        let result = self.store.close().await;

        let mut rx = self.status.subscribe();
        let settled = tokio::time::timeout(
            CLOSE_GRACE,
            rx.wait_for(|s| s.state == SessionState::Disconnected),
        )
        .await;
        if !matches!(settled, Ok(Ok(_))) {
            self.transition(SessionState::Disconnected, Some(DisconnectReason::Closed));
        }
        result
    }

    fn transition(&self, state: SessionState, reason: Option<DisconnectReason>) {
        self.status.send_if_modified(|status| {
            if status.state == SessionState::Disconnected || status.state == state {
                return false;
            }
            tracing::info!(
                "Session {} {} -> {}",
                self.store.session_id(),
                status.state,
                state
            );
            status.state = state;
            status.reason = reason;
            true
        });
    }

    /// Reason to record when the event stream ends without an expiry
    fn lost_reason(&self) -> DisconnectReason {
        if self.closing.load(Ordering::SeqCst) {
            DisconnectReason::Closed
        } else {
            DisconnectReason::ConnectionLost
        }
    }

    async fn notify_watchers(&self, event: &StoreEvent) -> Result<()> {
        let watchers = self.watchers.read().await.clone();
        for watcher in watchers {
            watcher.process(event).await?;
        }
        Ok(())
    }

    /// Deliver events in order until the session ends
    async fn dispatch(session: std::sync::Weak<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            let Some(session) = session.upgrade() else {
                return;
            };
            tracing::debug!("Session {} event {:?}", session.store.session_id(), event);

            let ending = match &event {
                StoreEvent::Connected => {
                    session.transition(SessionState::Connected, None);
                    None
                }
                StoreEvent::Disconnected => Some(session.lost_reason()),
                StoreEvent::Expired => Some(DisconnectReason::Expired),
                _ => None,
            };

            // Watchers see a lifecycle event before anyone waiting on the state does
            if let Err(e) = session.notify_watchers(&event).await {
                tracing::error!(
                    "Watcher failed on {} in session {}: {}; closing session",
                    event.type_name(),
                    session.store.session_id(),
                    e
                );
                if let Err(close_err) = session.store.close().await {
                    tracing::warn!("Failed to close session after watcher failure: {}", close_err);
                }
                session.transition(SessionState::Disconnected, Some(DisconnectReason::WatcherFailed(e.to_string())));
                return;
            }

            if let Some(reason) = ending {
                session.transition(SessionState::Disconnected, Some(reason));
                return;
            }
        }

        // Channel closed without a lifecycle event (local close, or the
        // store dropped the session): watchers still hear about it
        if let Some(session) = session.upgrade() {
            if let Err(e) = session.notify_watchers(&StoreEvent::Disconnected).await {
                tracing::warn!("Watcher failed on session teardown: {}", e);
            }
            let reason = session.lost_reason();
            session.transition(SessionState::Disconnected, Some(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{spawn_local, CreateMode, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        seen: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Watcher for Counter {
        async fn process(&self, event: &StoreEvent) -> Result<()> {
            if event.is_session_event() {
                return Ok(());
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::ConnectionLoss);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Teardown {
        disconnected: AtomicUsize,
    }

    #[async_trait]
    impl Watcher for Teardown {
        async fn process(&self, event: &StoreEvent) -> Result<()> {
            if *event == StoreEvent::Disconnected {
                self.disconnected.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_memory_session_lifecycle() {
        let namespace = MemoryStore::new();
        let (store, events) = namespace.connect().await;
        let session = CoordinationSession::start(Arc::new(store), events);

        session.wait_connected(Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        session.close().await.unwrap();
        assert_eq!(session.await_disconnect().await.unwrap(), DisconnectReason::Closed);
        assert_eq!(namespace.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_expiry_wakes_waiter() {
        let namespace = MemoryStore::new();
        let (store, events) = namespace.connect().await;
        let id = store.id();
        let session = CoordinationSession::start(Arc::new(store), events);
        session.wait_connected(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.await_disconnect().await })
        };
        namespace.expire_session(id).await;

        assert_eq!(waiter.await.unwrap().unwrap(), DisconnectReason::Expired);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_watcher_failure_closes_session() {
        let namespace = MemoryStore::new();
        let (store, events) = namespace.connect().await;
        let store = Arc::new(store);
        let session = CoordinationSession::start(store.clone(), events);
        let counter = Arc::new(Counter { seen: AtomicUsize::new(0), fail: true });
        session.add_watcher(counter.clone()).await;
        session.wait_connected(Duration::from_secs(1)).await.unwrap();

        store.create("/election", &[], CreateMode::Persistent).await.unwrap();
        store.create("/election/c_", &[], CreateMode::EphemeralSequential).await.unwrap();
        store.get_children("/election", true).await.unwrap();
        store.create("/election/c_", &[], CreateMode::EphemeralSequential).await.unwrap();

        let err = session.await_disconnect().await.unwrap_err();
        assert!(matches!(err, Error::WatchRearm(_)));
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);

        // Closing withdrew the ephemeral nodes
        let (observer, _events) = namespace.connect().await;
        assert!(observer.get_children("/election", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_to_remote_store() {
        let namespace = MemoryStore::new();
        let (server, address) = spawn_local(namespace.clone()).await.unwrap();

        let session = CoordinationSession::connect(&address, Duration::from_secs(3), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(namespace.session_count().await, 1);

        session.close().await.unwrap();
        assert_eq!(session.await_disconnect().await.unwrap(), DisconnectReason::Closed);
        assert_eq!(session.disconnect_reason(), Some(DisconnectReason::Closed));
        server.stop();
    }

    #[tokio::test]
    async fn test_remote_close_is_not_connection_loss() {
        let namespace = MemoryStore::new();
        let (server, address) = spawn_local(namespace.clone()).await.unwrap();

        for _ in 0..5 {
            let session = CoordinationSession::connect(&address, Duration::from_secs(3), Duration::from_secs(1))
                .await
                .unwrap();
            let teardown = Arc::new(Teardown::default());
            session.add_watcher(teardown.clone()).await;

            let waiter = {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.await_disconnect().await })
            };
            session.close().await.unwrap();

            assert_eq!(waiter.await.unwrap().unwrap(), DisconnectReason::Closed);
            assert_eq!(teardown.disconnected.load(Ordering::SeqCst), 1);
        }
        assert_eq!(namespace.session_count().await, 0);
        server.stop();
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_store() {
        let result = CoordinationSession::connect("127.0.0.1:1", Duration::from_secs(3), Duration::from_millis(300)).await;
        assert!(result.is_err());
    }
}
