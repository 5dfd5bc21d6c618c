//! Service membership discovery.
//!
//! [`Resolver::watch`] keeps one task per service that waits for a children
//! watch firing, re-arms the watch, re-reads the membership and publishes a
//! new [`AddressSnapshot`] whenever the address set changed. Snapshots carry
//! strictly increasing versions per service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use config::AclPolicy;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bootstrap::ensure_path;
use crate::error::{RegistryError, RegistryResult};
use crate::metrics;
use crate::models::{Address, AddressSet, AddressSnapshot};
use crate::path::{self, Namespace, ServiceName};
use crate::session::Session;

/// Delay before retrying a membership read that failed transiently.
const RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct Resolver {
    session: Arc<Session>,
    namespace: Namespace,
    acl: AclPolicy,
    watches: Mutex<HashMap<ServiceName, watch::Receiver<AddressSnapshot>>>,
    changes: mpsc::UnboundedSender<ServiceName>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Resolver {
    /// Returns the resolver and the receiving end of its change channel,
    /// which reports every service whose membership changed after its
    /// initial snapshot.
    pub fn new(
        session: Arc<Session>,
        namespace: Namespace,
        acl: AclPolicy,
        token: CancellationToken,
        tracker: TaskTracker,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceName>) {
        let (changes, rx) = mpsc::unbounded_channel();
        let resolver = Self {
            session,
            namespace,
            acl,
            watches: Mutex::new(HashMap::new()),
            changes,
            token,
            tracker,
        };
        (resolver, rx)
    }

    /// One-shot read of the current membership, without a watch.
    pub async fn resolve(&self, service: &ServiceName) -> RegistryResult<AddressSet> {
        let service_path = self.namespace.service_path(service);
        let children = match self.session.children(&service_path).await {
            Ok(children) => children,
            Err(RegistryError::NoNode(_)) => return Ok(AddressSet::new()),
            Err(err) => return Err(resolve_err(service, err)),
        };
        read_members(&self.session, service, &service_path, children)
            .await
            .map_err(|e| resolve_err(service, e))
    }

    /// Subscribe to the membership of `service`.
    ///
    /// The first call for a service bootstraps its path, arms the watch and
    /// reads the initial snapshot (version 1) before returning. Later calls
    /// share the same task and channel.
    pub async fn watch(
        &self,
        service: &ServiceName,
    ) -> RegistryResult<watch::Receiver<AddressSnapshot>> {
        let mut watches = self.watches.lock().await;
        if let Some(rx) = watches.get(service) {
            // a closed channel means the loop ended; start over
            if rx.has_changed().is_ok() {
                return Ok(rx.clone());
            }
            watches.remove(service);
            metrics::WATCHED_SERVICES.dec();
        }
        if self.token.is_cancelled() {
            return Err(RegistryError::Closed);
        }

        let service_path = self.namespace.service_path(service);
        ensure_path(&self.session, self.namespace.root(), self.acl).await?;
        ensure_path(&self.session, &service_path, self.acl).await?;

        let firings = self.session.subscribe_children(&service_path);
        let children = self
            .session
            .children_w(&service_path)
            .await
            .map_err(|e| resolve_err(service, e))?;
        let addresses = read_members(&self.session, service, &service_path, children)
            .await
            .map_err(|e| resolve_err(service, e))?;

        let (tx, rx) = watch::channel(AddressSnapshot::new(1, addresses));
        let task = WatchTask {
            session: self.session.clone(),
            service: service.clone(),
            service_path,
            acl: self.acl,
            firings,
            snapshots: tx,
            changes: self.changes.clone(),
            token: self.token.clone(),
        };
        self.tracker.spawn(task.run());
        info!(%service, "watching service membership");
        metrics::WATCHED_SERVICES.inc();

        watches.insert(service.clone(), rx.clone());
        Ok(rx)
    }

    /// Services with an active watch.
    pub async fn watched(&self) -> Vec<ServiceName> {
        let mut services: Vec<_> = self.watches.lock().await.keys().cloned().collect();
        services.sort();
        services
    }
}

struct WatchTask {
    session: Arc<Session>,
    service: ServiceName,
    service_path: String,
    acl: AclPolicy,
    firings: mpsc::UnboundedReceiver<()>,
    snapshots: watch::Sender<AddressSnapshot>,
    changes: mpsc::UnboundedSender<ServiceName>,
    token: CancellationToken,
}

impl WatchTask {
    async fn run(mut self) {
        loop {
            let fired = tokio::select! {
                _ = self.token.cancelled() => break,
                fired = self.firings.recv() => fired,
            };
            if fired.is_none() {
                // subscription dropped: session expired or closed
                break;
            }
            // firings that arrived while we were busy are covered by the next read
            while self.firings.try_recv().is_ok() {}
            metrics::WATCH_FIRINGS.inc();

            let Some(addresses) = self.rearm_and_read().await else {
                break;
            };
            let service = &self.service;
            let published = self.snapshots.send_if_modified(|current| {
                if current.addresses == addresses {
                    return false;
                }
                let next = AddressSnapshot::new(current.version + 1, addresses);
                current.advance(next)
            });
            if published {
                let version = self.snapshots.borrow().version;
                debug!(%service, version, "membership changed");
                let _ = self.changes.send(self.service.clone());
            }
        }
        debug!(service = %self.service, "membership watch stopped");
    }

    /// Re-arm the watch and read the membership, retrying transient failures.
    /// A service path deleted under the watch is recreated, so it reads as an
    /// empty set. `None` once the session is gone or the task is cancelled.
    async fn rearm_and_read(&self) -> Option<AddressSet> {
        loop {
            let result = match self.session.children_w(&self.service_path).await {
                Ok(children) => {
                    read_members(&self.session, &self.service, &self.service_path, children).await
                }
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(addresses) => return Some(addresses),
                Err(RegistryError::NoNode(path)) if path == self.service_path => {
                    info!(service = %self.service, "service path removed, recreating");
                    match ensure_path(&self.session, &self.service_path, self.acl).await {
                        Ok(()) => continue,
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };
            if err.is_terminal() {
                warn!(service = %self.service, error = %err, "membership watch ended");
                return None;
            }
            warn!(service = %self.service, error = %err, "membership read failed, retrying");
            tokio::select! {
                _ = self.token.cancelled() => return None,
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }
    }
}

/// Read and parse the payload of each child. Children that vanished between
/// listing and reading, or carry a malformed payload, are skipped.
async fn read_members(
    session: &Session,
    service: &ServiceName,
    service_path: &str,
    children: Vec<String>,
) -> RegistryResult<AddressSet> {
    let mut addresses = AddressSet::new();
    for child in children {
        let child_path = path::join(service_path, &child);
        let Some(payload) = session.get_data(&child_path).await? else {
            continue;
        };
        match Address::from_payload(&payload) {
            Ok(address) => {
                addresses.insert(address);
            }
            Err(err) => {
                metrics::MALFORMED_ENTRIES.inc();
                warn!(%service, node = %child_path, error = %err, "skipping malformed registration entry");
            }
        }
    }
    Ok(addresses)
}

fn resolve_err(service: &ServiceName, err: RegistryError) -> RegistryError {
    match err {
        RegistryError::SessionExpired | RegistryError::Closed | RegistryError::Resolve { .. } => {
            err
        }
        other => RegistryError::Resolve {
            service: service.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateMode;
    use crate::store::memory::MemoryCluster;
    use crate::store::{Connector, EventStream, Store};
    use async_trait::async_trait;
    use config::RegistryConfig;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    const WAIT: Duration = Duration::from_secs(5);

    /// Read faults injected into a memory session.
    #[derive(Default)]
    struct Faults {
        /// number of upcoming `get_data` calls that fail
        failures: AtomicUsize,
        /// paths that read as already deleted
        vanished: parking_lot::Mutex<HashSet<String>>,
    }

    struct FaultyStore {
        inner: Arc<dyn Store>,
        faults: Arc<Faults>,
    }

    #[async_trait]
    impl Store for FaultyStore {
        fn session_id(&self) -> &str {
            self.inner.session_id()
        }

        async fn exists(&self, path: &str) -> RegistryResult<bool> {
            self.inner.exists(path).await
        }

        async fn get_data(&self, path: &str) -> RegistryResult<Option<Vec<u8>>> {
            if self.faults.vanished.lock().contains(path) {
                return Ok(None);
            }
            if self
                .faults
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RegistryError::Transport("read timed out".into()));
            }
            self.inner.get_data(path).await
        }

        async fn create(
            &self,
            path: &str,
            data: &[u8],
            mode: CreateMode,
            acl: AclPolicy,
        ) -> RegistryResult<String> {
            self.inner.create(path, data, mode, acl).await
        }

        async fn delete(&self, path: &str) -> RegistryResult<()> {
            self.inner.delete(path).await
        }

        async fn children(&self, path: &str) -> RegistryResult<Vec<String>> {
            self.inner.children(path).await
        }

        async fn children_w(&self, path: &str) -> RegistryResult<Vec<String>> {
            self.inner.children_w(path).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    struct FaultyConnector {
        cluster: MemoryCluster,
        faults: Arc<Faults>,
    }

    #[async_trait]
    impl Connector for FaultyConnector {
        async fn connect(
            &self,
            config: &RegistryConfig,
        ) -> RegistryResult<(Arc<dyn Store>, EventStream)> {
            let (inner, events) = self.cluster.connect(config).await?;
            let store = FaultyStore {
                inner,
                faults: self.faults.clone(),
            };
            Ok((Arc::new(store), events))
        }
    }

    struct Fixture {
        cluster: MemoryCluster,
        session: Arc<Session>,
        resolver: Resolver,
        changes: mpsc::UnboundedReceiver<ServiceName>,
        token: CancellationToken,
        tracker: TaskTracker,
    }

    async fn fixture(root: &str) -> Fixture {
        let cluster = MemoryCluster::new();
        fixture_with(cluster.clone(), &cluster, root).await
    }

    async fn fixture_with(
        cluster: MemoryCluster,
        connector: &dyn Connector,
        root: &str,
    ) -> Fixture {
        let config = RegistryConfig::new(["memory"]);
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (session, events) = Session::connect(&config, connector).await.unwrap();
        tracker.spawn(session.clone().run_dispatcher(events, token.clone()));
        let (resolver, changes) = Resolver::new(
            session.clone(),
            Namespace::new(root).unwrap(),
            AclPolicy::Open,
            token.clone(),
            tracker.clone(),
        );
        Fixture {
            cluster,
            session,
            resolver,
            changes,
            token,
            tracker,
        }
    }

    /// Write an entry through a separate session so the resolver session's
    /// watch sees it as a remote change.
    async fn put_raw(cluster: &MemoryCluster, prefix: &str, payload: &[u8]) -> String {
        let (store, _events) = cluster
            .connect(&RegistryConfig::new(["memory"]))
            .await
            .unwrap();
        store
            .create(prefix, payload, CreateMode::Persistent, AclPolicy::Open)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_watch_unknown_service_is_empty() {
        let fx = fixture("/rpc").await;
        let echo = ServiceName::new("echo").unwrap();
        let rx = fx.resolver.watch(&echo).await.unwrap();
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.addresses.is_empty());
        assert!(fx.cluster.exists("/rpc/echo"));
        assert!(fx.resolver.resolve(&echo).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_publishes_every_change() {
        let mut fx = fixture("/rpc").await;
        let echo = ServiceName::new("echo").unwrap();
        let mut rx = fx.resolver.watch(&echo).await.unwrap();

        put_raw(&fx.cluster, "/rpc/echo/a", b"10.0.0.1:9000").await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().addresses.len(), 1);
        assert_eq!(fx.changes.recv().await, Some(echo.clone()));

        put_raw(&fx.cluster, "/rpc/echo/b", b"10.0.0.2:9000").await;
        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.addresses.len(), 2);
        assert!(snapshot.version >= 3);

        // a second watch call shares the channel
        let again = fx.resolver.watch(&echo).await.unwrap();
        assert_eq!(again.borrow().version, snapshot.version);
        assert_eq!(fx.resolver.watched().await, vec![echo]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_payload_skipped() {
        let fx = fixture("/").await;
        let echo = ServiceName::new("echo").unwrap();
        fx.resolver.watch(&echo).await.unwrap();
        put_raw(&fx.cluster, "/echo/good", b"10.0.0.1:9000").await;
        put_raw(&fx.cluster, "/echo/noport", b"10.0.0.1").await;
        put_raw(&fx.cluster, "/echo/badport", b"10.0.0.1:http").await;
        put_raw(&fx.cluster, "/echo/binary", &[0xff, 0x00]).await;

        let addresses = fx.resolver.resolve(&echo).await.unwrap();
        assert_eq!(
            addresses.iter().collect::<Vec<_>>(),
            vec![&Address::new("10.0.0.1", 9000)]
        );
        assert!(logs_contain("skipping malformed registration entry"));
    }

    #[tokio::test]
    async fn test_transient_read_error_retried() {
        let cluster = MemoryCluster::new();
        let faults = Arc::new(Faults::default());
        let connector = FaultyConnector {
            cluster: cluster.clone(),
            faults: faults.clone(),
        };
        let mut fx = fixture_with(cluster, &connector, "/rpc").await;
        let echo = ServiceName::new("echo").unwrap();
        let mut rx = fx.resolver.watch(&echo).await.unwrap();

        faults.failures.store(1, Ordering::SeqCst);
        put_raw(&fx.cluster, "/rpc/echo/a", b"10.0.0.1:9000").await;
        tokio::time::timeout(WAIT, rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow_and_update().addresses.len(), 1);
        assert_eq!(faults.failures.load(Ordering::SeqCst), 0);
        assert_eq!(fx.changes.recv().await, Some(echo.clone()));

        // still watching after the failed read
        put_raw(&fx.cluster, "/rpc/echo/b", b"10.0.0.2:9000").await;
        tokio::time::timeout(WAIT, rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow_and_update().addresses.len(), 2);
    }

    #[tokio::test]
    async fn test_child_deleted_before_read_skipped() {
        let cluster = MemoryCluster::new();
        let faults = Arc::new(Faults::default());
        let connector = FaultyConnector {
            cluster: cluster.clone(),
            faults: faults.clone(),
        };
        let fx = fixture_with(cluster, &connector, "/rpc").await;
        let echo = ServiceName::new("echo").unwrap();
        let mut rx = fx.resolver.watch(&echo).await.unwrap();

        let gone = put_raw(&fx.cluster, "/rpc/echo/gone", b"10.0.0.9:9000").await;
        faults.vanished.lock().insert(gone);
        put_raw(&fx.cluster, "/rpc/echo/kept", b"10.0.0.1:9000").await;

        let kept = Address::new("10.0.0.1", 9000);
        let addresses = fx.resolver.resolve(&echo).await.unwrap();
        assert_eq!(addresses.iter().collect::<Vec<_>>(), vec![&kept]);

        tokio::time::timeout(WAIT, rx.wait_for(|s| s.addresses.contains(&kept)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_service_path_recreated() {
        let fx = fixture("/rpc").await;
        let echo = ServiceName::new("echo").unwrap();
        let mut rx = fx.resolver.watch(&echo).await.unwrap();

        let (admin, _events) = fx
            .cluster
            .connect(&RegistryConfig::new(["memory"]))
            .await
            .unwrap();
        admin.delete("/rpc/echo").await.unwrap();
        tokio::time::timeout(WAIT, async {
            while !fx.cluster.exists("/rpc/echo") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        put_raw(&fx.cluster, "/rpc/echo/a", b"10.0.0.1:9000").await;
        tokio::time::timeout(WAIT, rx.wait_for(|s| s.addresses.len() == 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fx.resolver.resolve(&echo).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_ends_on_expiry() {
        let fx = fixture("/rpc").await;
        let echo = ServiceName::new("echo").unwrap();
        let mut rx = fx.resolver.watch(&echo).await.unwrap();

        fx.cluster.expire_session(fx.session.session_id());
        // sender dropped once the loop exits
        while rx.changed().await.is_ok() {}
        assert!(fx.resolver.watch(&echo).await.unwrap_err().is_session_expired());
    }

    #[tokio::test]
    async fn test_cancel_stops_tasks() {
        let fx = fixture("/rpc").await;
        fx.resolver
            .watch(&ServiceName::new("a").unwrap())
            .await
            .unwrap();
        fx.resolver
            .watch(&ServiceName::new("b").unwrap())
            .await
            .unwrap();
        assert_eq!(fx.tracker.len(), 3);

        fx.token.cancel();
        fx.tracker.close();
        fx.tracker.wait().await;
        assert!(fx.tracker.is_empty());
    }
}
