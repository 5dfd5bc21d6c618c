//! Coordination session.
//!
//! Wraps one [`Store`] session: surfaces its lifecycle as an observable
//! [`SessionState`], routes one-shot children-watch firings to the
//! subscribers interested in a path, and remembers the ephemeral nodes this
//! process created so they can be removed before the session is closed.
//!
//! `Expired` and `Closed` are terminal. Once expired, every operation fails
//! with [`RegistryError::SessionExpired`] and children subscriptions are
//! dropped, which ends the watch loops reading them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use config::{AclPolicy, RegistryConfig};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::metrics;
use crate::models::{CreateMode, SessionState};
use crate::store::{Connector, EventStream, Store, StoreEvent};

pub struct Session {
    store: Arc<dyn Store>,
    state: watch::Sender<SessionState>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<()>>>>,
    owned: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.store.session_id())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Session {
    /// Open a session, giving up after `session_timeout` if no server answers.
    ///
    /// Returns the session together with its raw event stream; feed the
    /// stream to [`Session::run_dispatcher`].
    pub async fn connect(
        config: &RegistryConfig,
        connector: &dyn Connector,
    ) -> RegistryResult<(Arc<Self>, EventStream)> {
        let (store, events) =
            match tokio::time::timeout(config.session_timeout, connector.connect(config)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(err @ RegistryError::Connect(_))) => return Err(err),
                Ok(Err(err)) => return Err(RegistryError::Connect(err.to_string())),
                Err(_) => {
                    return Err(RegistryError::Connect(format!(
                        "no coordination server in {:?} answered within {:?}",
                        config.servers, config.session_timeout
                    )));
                }
            };
        info!(session_id = store.session_id(), "coordination session connected");
        Ok((Arc::new(Self::new(store)), events))
    }

    pub fn new(store: Arc<dyn Store>) -> Self {
        let (state, _) = watch::channel(SessionState::Connected);
        Self {
            store,
            state,
            subscribers: Mutex::new(HashMap::new()),
            owned: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        self.store.session_id()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Route store events until the stream ends or `token` is cancelled.
    pub async fn run_dispatcher(self: Arc<Self>, mut events: EventStream, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(StoreEvent::ChildrenChanged { path }) => self.notify(&path),
                Some(StoreEvent::Session(state)) => self.transition(state),
                None => {
                    debug!("session event stream ended");
                    break;
                }
            }
        }
    }

    fn notify(&self, path: &str) {
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(path) {
            senders.retain(|tx| tx.send(()).is_ok());
            if senders.is_empty() {
                subscribers.remove(path);
            }
        }
    }

    fn transition(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if !changed {
            return;
        }
        match next {
            SessionState::Expired => {
                warn!(
                    session_id = self.session_id(),
                    "coordination session expired, registrations and watches are gone"
                );
                metrics::SESSION_EXPIRATIONS.inc();
                self.subscribers.lock().clear();
                self.owned.lock().clear();
            }
            SessionState::Connecting => {
                warn!(session_id = self.session_id(), "coordination session disconnected")
            }
            state => info!(session_id = self.session_id(), %state, "coordination session state"),
        }
    }

    fn check(&self) -> RegistryResult<()> {
        match self.state() {
            SessionState::Expired => Err(RegistryError::SessionExpired),
            SessionState::Closed => Err(RegistryError::Closed),
            _ => Ok(()),
        }
    }

    fn observe<T>(&self, result: RegistryResult<T>) -> RegistryResult<T> {
        if let Err(RegistryError::SessionExpired) = &result {
            self.transition(SessionState::Expired);
        }
        result
    }

    pub async fn exists(&self, path: &str) -> RegistryResult<bool> {
        self.check()?;
        self.observe(self.store.exists(path).await)
    }

    pub async fn get_data(&self, path: &str) -> RegistryResult<Option<Vec<u8>>> {
        self.check()?;
        self.observe(self.store.get_data(path).await)
    }

    pub async fn create_persistent(&self, path: &str, acl: AclPolicy) -> RegistryResult<String> {
        self.check()?;
        self.observe(self.store.create(path, &[], CreateMode::Persistent, acl).await)
    }

    /// Create an ephemeral sequential node under `prefix`. The node is
    /// removed when the session ends.
    pub async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        data: &[u8],
        acl: AclPolicy,
    ) -> RegistryResult<String> {
        self.check()?;
        let created = self.observe(
            self.store
                .create(prefix, data, CreateMode::EphemeralSequential, acl)
                .await,
        )?;
        self.owned.lock().insert(created.clone());
        Ok(created)
    }

    pub async fn delete(&self, path: &str) -> RegistryResult<()> {
        self.check()?;
        let result = self.observe(self.store.delete(path).await);
        if result.is_ok() || matches!(result, Err(RegistryError::NoNode(_))) {
            self.owned.lock().remove(path);
        }
        result
    }

    pub async fn children(&self, path: &str) -> RegistryResult<Vec<String>> {
        self.check()?;
        self.observe(self.store.children(path).await)
    }

    /// List children of `path` and arm a one-shot watch on it. The firing is
    /// delivered to every receiver from [`Session::subscribe_children`].
    pub async fn children_w(&self, path: &str) -> RegistryResult<Vec<String>> {
        self.check()?;
        self.observe(self.store.children_w(path).await)
    }

    /// Receive a unit every time a children watch on `path` fires.
    ///
    /// Subscribe before arming with [`Session::children_w`]. The receiver is
    /// closed when the session expires.
    pub fn subscribe_children(&self, path: &str) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.state().is_terminal() {
            self.subscribers
                .lock()
                .entry(path.to_owned())
                .or_default()
                .push(tx);
        }
        rx
    }

    /// Ephemeral nodes created through this session and not yet deleted.
    pub fn owned(&self) -> Vec<String> {
        let mut owned: Vec<String> = self.owned.lock().iter().cloned().collect();
        owned.sort();
        owned
    }

    /// Remove owned ephemeral nodes, then end the session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.state().is_terminal() {
            for path in self.owned() {
                match self.store.delete(&path).await {
                    Ok(()) | Err(RegistryError::NoNode(_)) => {}
                    Err(err) => warn!(%path, error = %err, "failed to remove entry on close"),
                }
            }
        }
        self.owned.lock().clear();
        self.store.close().await;
        self.transition(SessionState::Closed);
        self.subscribers.lock().clear();
        debug!(session_id = self.session_id(), "coordination session closed");
    }
}
