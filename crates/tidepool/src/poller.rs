//! Polling backstop: fixed-interval invalidation of a domain's
//! critical keys.
//!
//! Push delivery is a latency optimization, not a guarantee. The poller
//! runs regardless of channel health, so worst-case staleness of a
//! critical key is bounded by the interval even when the channel is
//! silently dead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::keys::{Domain, QueryKey};
use crate::store::QueryCache;

/// Floor for poll intervals. Protects the backend from a
/// misconfigured profile hammering it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Unconditional per-domain invalidation timer.
pub struct FallbackPoller {
    domain: Domain,
    keys: Vec<QueryKey>,
    interval: Duration,
    store: Arc<QueryCache>,
    ticks: AtomicU64,
}

impl FallbackPoller {
    /// Intervals below [`MIN_POLL_INTERVAL`] are clamped up.
    pub fn new(
        domain: Domain,
        keys: Vec<QueryKey>,
        interval: Duration,
        store: Arc<QueryCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            domain,
            keys,
            interval: interval.max(MIN_POLL_INTERVAL),
            store,
            ticks: AtomicU64::new(0),
        })
    }

    /// Effective interval after clamping.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of completed poll ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Invalidate the critical keys every interval until shutdown. The
    /// first tick happens one interval after start.
    #[tracing::instrument(skip(self, shutdown), fields(domain = %self.domain))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            keys = self.keys.len(),
            "polling backstop started"
        );
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(domain = %self.domain, "polling backstop stopped");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.tick();
                }
            }
        }
    }

    fn tick(&self) {
        trace!(domain = %self.domain, keys = self.keys.len(), "poll tick");
        for key in &self.keys {
            self.store.invalidate(key);
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CacheEvent;

    fn drain_invalidations(events: &mut tokio::sync::broadcast::Receiver<CacheEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CacheEvent::Invalidated { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidates_critical_keys_every_interval() {
        let store = QueryCache::new(64);
        let mut events = store.subscribe();
        let poller = FallbackPoller::new(
            Domain::from("contacts"),
            vec![
                QueryKey::root("client-stats"),
                QueryKey::root("dashboard-metrics"),
            ],
            Duration::from_secs(30),
            Arc::clone(&store),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&poller).run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(poller.ticks(), 1);
        assert_eq!(drain_invalidations(&mut events), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(poller.ticks(), 2);
        assert_eq!(drain_invalidations(&mut events), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_before_first_interval() {
        let store = QueryCache::new(64);
        let poller = FallbackPoller::new(
            Domain::from("contacts"),
            vec![QueryKey::root("contacts")],
            Duration::from_secs(30),
            Arc::clone(&store),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&poller).run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(poller.ticks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_ticks() {
        let store = QueryCache::new(64);
        let poller = FallbackPoller::new(
            Domain::from("contacts"),
            vec![QueryKey::root("contacts")],
            Duration::from_secs(30),
            Arc::clone(&store),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&poller).run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(31)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(poller.ticks(), 1);
    }

    #[test]
    fn test_interval_clamped_to_floor() {
        let store = QueryCache::new(64);
        let poller = FallbackPoller::new(
            Domain::from("contacts"),
            vec![],
            Duration::from_secs(1),
            store,
        );
        assert_eq!(poller.interval(), MIN_POLL_INTERVAL);
    }
}
