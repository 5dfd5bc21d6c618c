//! Periodic wholesale invalidation of the connection cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::cache::ConnectionCache;
use crate::dialer::Dialer;

#[derive(Debug, Clone, Copy)]
pub struct RefreshScheduler {
    interval: Duration,
}

impl RefreshScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the ticker on `tracker`. The first tick fires one interval from
    /// now; the task ends when `token` is cancelled.
    pub fn spawn<D: Dialer>(
        self,
        cache: Arc<ConnectionCache<D>>,
        token: CancellationToken,
        tracker: &TaskTracker,
    ) {
        tracker.spawn(self.run(cache, token));
    }

    async fn run<D: Dialer>(self, cache: Arc<ConnectionCache<D>>, token: CancellationToken) {
        info!(interval = ?self.interval, "connection refresh scheduled");
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("connection refresh stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let removed = cache.clear("refresh");
                    debug!(removed, "refreshed connection cache");
                }
            }
        }
    }
}
