//! Lazily populated connection sets, one per service.
//!
//! An entry is built the first time a service is looked up, by dialing every
//! address of the current membership snapshot concurrently. It is dropped
//! wholesale when membership changes, on every refresh tick, and after an
//! unregister. Dropping an entry never closes connections already handed out;
//! those stay usable until their holders drop them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dialer::{Connection, Dialer, dial_with_timeout};
use crate::metrics;
use crate::models::AddressSnapshot;
use crate::path::ServiceName;

/// Connections dialed from one membership snapshot.
#[derive(Debug)]
struct CachedSet<C> {
    version: u64,
    connections: Vec<Connection<C>>,
}

type Slot<C> = Arc<OnceCell<Arc<CachedSet<C>>>>;

pub struct ConnectionCache<D: Dialer> {
    dialer: Arc<D>,
    dial_timeout: Duration,
    entries: Mutex<HashMap<ServiceName, Slot<D::Conn>>>,
}

impl<D: Dialer> std::fmt::Debug for ConnectionCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("services", &self.services())
            .field("dial_timeout", &self.dial_timeout)
            .finish()
    }
}

impl<D: Dialer> ConnectionCache<D> {
    pub fn new(dialer: Arc<D>, dial_timeout: Duration) -> Self {
        Self {
            dialer,
            dial_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Connections for `service`, dialing the addresses of `snapshot` if
    /// nothing is cached or the cached set predates it.
    ///
    /// Concurrent misses for one service share a single population.
    pub async fn get(
        &self,
        service: &ServiceName,
        snapshot: &AddressSnapshot,
    ) -> Vec<Connection<D::Conn>> {
        loop {
            let slot = self.entries.lock().entry(service.clone()).or_default().clone();

            let populated = AtomicBool::new(false);
            let set = slot
                .get_or_init(|| async {
                    populated.store(true, Ordering::Relaxed);
                    Arc::new(self.populate(service, snapshot).await)
                })
                .await
                .clone();

            if set.version < snapshot.version {
                // built from an older membership; drop it unless someone else already did
                let mut entries = self.entries.lock();
                if entries.get(service).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    entries.remove(service);
                }
                continue;
            }

            if populated.load(Ordering::Relaxed) {
                metrics::CACHE_MISSES.inc();
            } else {
                metrics::CACHE_HITS.inc();
                trace!(%service, version = set.version, "connection cache hit");
            }
            return set.connections.clone();
        }
    }

    async fn populate(
        &self,
        service: &ServiceName,
        snapshot: &AddressSnapshot,
    ) -> CachedSet<D::Conn> {
        let dials = snapshot.addresses.iter().map(|address| async move {
            match dial_with_timeout(self.dialer.as_ref(), address, self.dial_timeout).await {
                Ok(conn) => Some(Connection::new(address.clone(), conn)),
                Err(err) => {
                    warn!(%service, %address, error = %err, "skipping unreachable address");
                    None
                }
            }
        });
        let connections: Vec<_> = join_all(dials).await.into_iter().flatten().collect();
        debug!(
            %service,
            version = snapshot.version,
            addresses = snapshot.addresses.len(),
            connected = connections.len(),
            "populated connection set"
        );
        CachedSet {
            version: snapshot.version,
            connections,
        }
    }

    /// Drop the entry for `service`. Returns whether one was present.
    pub fn invalidate(&self, service: &ServiceName) -> bool {
        let removed = self.entries.lock().remove(service).is_some();
        if removed {
            metrics::CACHE_INVALIDATIONS
                .with_label_values(&["membership"])
                .inc();
            debug!(%service, "connection cache entry invalidated");
        }
        removed
    }

    /// Drop every entry. Returns how many were present.
    pub fn invalidate_all(&self) -> usize {
        self.clear("manual")
    }

    pub(crate) fn clear(&self, cause: &str) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            let n = entries.len();
            entries.clear();
            n
        };
        metrics::CACHE_INVALIDATIONS
            .with_label_values(&[cause])
            .inc();
        debug!(cause, removed, "connection cache cleared");
        removed
    }

    /// Services with a cached (or populating) entry.
    pub fn services(&self) -> Vec<ServiceName> {
        let mut services: Vec<_> = self.entries.lock().keys().cloned().collect();
        services.sort();
        services
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Invalidate services as membership changes are reported, until cancelled.
pub async fn run_invalidator<D: Dialer>(
    cache: Arc<ConnectionCache<D>>,
    mut changes: mpsc::UnboundedReceiver<ServiceName>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            change = changes.recv() => match change {
                Some(service) => {
                    cache.invalidate(&service);
                }
                None => break,
            },
        }
    }
    debug!("cache invalidator stopped");
}
