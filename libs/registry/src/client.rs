//! Registry client: the one object applications hold.
//!
//! Owns the coordination session and every background task (session
//! dispatcher, cache invalidator, refresh ticker, one membership watch per
//! looked-up service), all tracked on one `TaskTracker` and stopped through
//! one `CancellationToken`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use config::RegistryConfig;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::bootstrap::ensure_path;
use crate::cache::{ConnectionCache, run_invalidator};
use crate::dialer::{Connection, Dialer, GrpcDialer};
use crate::error::{RegistryError, RegistryResult};
use crate::models::{Address, AddressSet, AddressSnapshot, SessionState};
use crate::path::{Namespace, ServiceName};
use crate::refresh::RefreshScheduler;
use crate::registrar::{Registrar, Registration};
use crate::resolver::Resolver;
use crate::session::Session;
use crate::store::Connector;
use crate::store::nats::NatsConnector;

/// Client for registering RPC servers and discovering them.
///
/// Cheap to clone; clones share the session, cache and registration.
pub struct RegistryClient<D: Dialer = GrpcDialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for RegistryClient<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<D: Dialer> {
    config: RegistryConfig,
    namespace: Namespace,
    session: Arc<Session>,
    cache: Arc<ConnectionCache<D>>,
    resolver: Resolver,
    registrar: Registrar<D>,
    token: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl<D: Dialer> Drop for Inner<D> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<D: Dialer> std::fmt::Debug for RegistryClient<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("root", &self.inner.namespace.root())
            .field("session", &self.inner.session)
            .field("background_tasks", &self.inner.tracker.len())
            .finish()
    }
}

impl RegistryClient<GrpcDialer> {
    /// Connect to the NATS servers in `config` and dial RPC servers over gRPC.
    pub async fn connect_nats(config: RegistryConfig) -> RegistryResult<Self> {
        let dialer = GrpcDialer::new(config.dial.clone());
        Self::connect(config, &NatsConnector::new(), dialer).await
    }
}

impl<D: Dialer> RegistryClient<D> {
    /// Open a session through `connector`, bootstrap the root path and start
    /// the background tasks.
    ///
    /// Fails with `Connect` if no coordination server answers within the
    /// session timeout, and with `Bootstrap` if the root cannot be created.
    pub async fn connect(
        config: RegistryConfig,
        connector: &dyn Connector,
        dialer: D,
    ) -> RegistryResult<Self> {
        config
            .validate()
            .map_err(|e| RegistryError::Config(format!("{e:#}")))?;
        let namespace = Namespace::new(&config.root)?;

        let (session, events) = Session::connect(&config, connector).await?;
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(session.clone().run_dispatcher(events, token.clone()));

        if let Err(err) = ensure_path(&session, namespace.root(), config.acl).await {
            token.cancel();
            tracker.close();
            session.close().await;
            tracker.wait().await;
            return Err(err);
        }

        let dialer = Arc::new(dialer);
        let cache = Arc::new(ConnectionCache::new(dialer.clone(), config.dial.timeout));
        let (resolver, changes) = Resolver::new(
            session.clone(),
            namespace.clone(),
            config.acl,
            token.clone(),
            tracker.clone(),
        );
        tracker.spawn(run_invalidator(cache.clone(), changes, token.clone()));
        RefreshScheduler::new(config.refresh_interval).spawn(cache.clone(), token.clone(), &tracker);
        let registrar = Registrar::new(
            session.clone(),
            namespace.clone(),
            config.acl,
            dialer,
            config.dial.timeout,
            cache.clone(),
        );

        info!(
            root = namespace.root(),
            session_id = session.session_id(),
            acl = %config.acl,
            "registry client ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                namespace,
                session,
                cache,
                resolver,
                registrar,
                token,
                tracker,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn check(&self) -> RegistryResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        match self.inner.session.state() {
            SessionState::Expired => Err(RegistryError::SessionExpired),
            SessionState::Closed => Err(RegistryError::Closed),
            _ => Ok(()),
        }
    }

    /// Register this process as serving `service` at `host:port`.
    pub async fn register(
        &self,
        service: &str,
        host: &str,
        port: u16,
    ) -> RegistryResult<Registration> {
        self.check()?;
        let service = ServiceName::new(service)?;
        self.inner
            .registrar
            .register(&service, Address::new(host, port))
            .await
    }

    /// Remove the registration made by [`RegistryClient::register`] and
    /// clear the local connection cache.
    pub async fn unregister(&self) -> RegistryResult<Registration> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        self.inner.registrar.unregister().await
    }

    /// An additional logical instance sharing this client's session. Its
    /// registration is independent from the client's own.
    pub fn registrar(&self) -> Registrar<D> {
        self.inner.registrar.fork()
    }

    /// Connections to every reachable instance of `service`.
    ///
    /// Served from the cache when possible. An unknown service or one with
    /// no reachable instance gives an empty list.
    pub async fn get_connections(&self, service: &str) -> RegistryResult<Vec<Connection<D::Conn>>> {
        self.check()?;
        let service = ServiceName::new(service)?;
        let lookup = async {
            let rx = self.inner.resolver.watch(&service).await?;
            let snapshot = rx.borrow().clone();
            Ok(self.inner.cache.get(&service, &snapshot).await)
        };
        tokio::select! {
            _ = self.inner.token.cancelled() => Err(RegistryError::Closed),
            result = lookup => result,
        }
    }

    /// Membership snapshots of `service`, updated as instances come and go.
    pub async fn watch(&self, service: &str) -> RegistryResult<watch::Receiver<AddressSnapshot>> {
        self.check()?;
        let service = ServiceName::new(service)?;
        self.inner.resolver.watch(&service).await
    }

    /// Current membership of `service`, read once.
    pub async fn resolve(&self, service: &str) -> RegistryResult<AddressSet> {
        self.check()?;
        let service = ServiceName::new(service)?;
        self.inner.resolver.resolve(&service).await
    }

    pub fn session_id(&self) -> &str {
        self.inner.session.session_id()
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<SessionState> {
        self.inner.session.subscribe_state()
    }

    /// Path of this client's registration entry, if registered.
    pub async fn node(&self) -> Option<String> {
        self.inner.registrar.registration().await.map(|r| r.node)
    }

    pub fn root_path(&self) -> &str {
        self.inner.namespace.root()
    }

    /// Number of background tasks still running.
    pub fn background_tasks(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Stop every background task, remove this session's entries and end the
    /// session. Idempotent; operations still in flight fail with `Closed`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing registry client");
        self.inner.token.cancel();
        self.inner.tracker.close();
        self.inner.session.close().await;
        self.inner.tracker.wait().await;
        self.inner.cache.clear("close");
        info!("registry client closed");
    }
}
