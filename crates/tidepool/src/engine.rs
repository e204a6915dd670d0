//! Engine assembly and subscription lifecycle.
//!
//! `SyncEngine` owns the cache, the debounced invalidator, and one set of
//! background tasks per acquired domain (change listener, polling
//! backstop). Views hold a [`DomainHandle`] per acquisition; the last
//! release of a domain tears its tasks down. A refetch worker turns
//! invalidation events into background page fetches so reads stay
//! stale-while-revalidate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::debounce::DebouncedInvalidator;
use crate::keys::{Domain, QueryKey};
use crate::listener::{ChangeListener, ChannelState};
use crate::poller::FallbackPoller;
use crate::source::{ChannelFactory, DataSource, PageRequest};
use crate::store::{CacheEvent, QueryCache};
use crate::stream::{StreamController, StreamKey};

/// Ceiling for the gc sweep interval.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-domain background tasks and the subscriber count gating them.
struct DomainState {
    count: usize,
    /// Shutdown for this domain's listener and poller only.
    shutdown_tx: watch::Sender<bool>,
    listener: Option<Arc<ChangeListener>>,
    tasks: Vec<JoinHandle<()>>,
}

/// The realtime sync and cache-consistency engine.
///
/// One per process. Construct through [`SyncEngineBuilder`].
pub struct SyncEngine {
    config: Arc<EngineConfig>,
    store: Arc<QueryCache>,
    source: Arc<dyn DataSource>,
    channels: Arc<dyn ChannelFactory>,
    invalidator: Arc<DebouncedInvalidator>,
    domains: DashMap<Domain, DomainState>,
    /// Bumped when a domain's last subscriber releases; refetch results
    /// captured under an older epoch are dropped.
    epochs: DashMap<Domain, u64>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl SyncEngine {
    /// Start building an engine over the given backend ports.
    pub fn builder(
        source: Arc<dyn DataSource>,
        channels: Arc<dyn ChannelFactory>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder::new(source, channels)
    }

    /// The shared query cache.
    pub fn store(&self) -> Arc<QueryCache> {
        Arc::clone(&self.store)
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to cache events (updated / invalidated / evicted).
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.store.subscribe()
    }

    /// Acquire a domain, opening its channel and polling backstop on the
    /// first acquisition. Every acquire must be matched by one release;
    /// dropping the handle releases it.
    ///
    /// After [`shutdown`](Self::shutdown) the handle is inert: no tasks
    /// start and release is a no-op.
    pub fn acquire(self: &Arc<Self>, domain: impl Into<Domain>) -> DomainHandle {
        let domain = domain.into();
        if self.is_shut_down() {
            debug!(domain = %domain, "acquire after shutdown ignored");
            return DomainHandle {
                engine: Arc::clone(self),
                domain,
                released: AtomicBool::new(true),
            };
        }
        self.store.retain_domain(&domain);

        let mut entry = self.domains.entry(domain.clone()).or_insert_with(|| {
            let state = self.start_domain(&domain);
            info!(domain = %domain, "domain acquired, tasks started");
            state
        });
        entry.count += 1;
        trace!(domain = %domain, count = entry.count, "domain retained");
        drop(entry);

        DomainHandle {
            engine: Arc::clone(self),
            domain,
            released: AtomicBool::new(false),
        }
    }

    /// Number of live subscriptions for a domain.
    pub fn subscriber_count(&self, domain: &Domain) -> usize {
        self.domains.get(domain).map(|s| s.count).unwrap_or(0)
    }

    /// Channel state for a domain, if its tasks are running and it has a
    /// listener configured.
    pub fn channel_state(&self, domain: &Domain) -> Option<ChannelState> {
        self.domains
            .get(domain)?
            .listener
            .as_ref()
            .map(|l| l.state())
    }

    /// Whether the domain has any pending debounced invalidation.
    pub fn has_pending_invalidation(&self, domain: &Domain) -> bool {
        self.invalidator.has_pending(domain)
    }

    /// Immediate, non-debounced invalidation of a domain and its linked
    /// domains. Backs explicit refresh buttons.
    pub fn refresh_domain(&self, domain: &Domain) {
        debug!(domain = %domain, "manual refresh");
        self.store.invalidate_domain(domain);
        for linked in &self.config.domain(domain).linked {
            self.store.invalidate_domain(linked);
        }
    }

    /// Open a paginated stream controller for one conversation and start
    /// its background poll.
    pub fn open_stream(self: &Arc<Self>, key: StreamKey) -> Arc<StreamController> {
        let stream = StreamController::new(
            key,
            Arc::clone(&self.source),
            self.config.page_size,
            self.config.latest_window,
        );
        if let Some(interval) = self.config.stream_poll_interval {
            let _ = stream.spawn_poller(interval, self.shutdown_tx.subscribe());
        }
        stream
    }

    /// Stop every background task. Idempotent. Pending debounce timers
    /// are cancelled, not fired.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("sync engine shutting down");
        let _ = self.shutdown_tx.send(true);
        for mut entry in self.domains.iter_mut() {
            let _ = entry.shutdown_tx.send(true);
            if let Some(listener) = entry.listener.take() {
                listener.close();
            }
        }
        self.domains.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Spawn the listener and poller for a newly acquired domain.
    fn start_domain(self: &Arc<Self>, domain: &Domain) -> DomainState {
        let cfg = self.config.domain(domain);
        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::new();

        let listener = if cfg.channel {
            let listener = ChangeListener::new(
                domain.clone(),
                cfg.linked.clone(),
                Arc::clone(&self.invalidator),
            );
            tasks.push(tokio::spawn(
                Arc::clone(&listener).run(Arc::clone(&self.channels), shutdown_tx.subscribe()),
            ));
            Some(listener)
        } else {
            None
        };

        if let Some(interval) = cfg.poll_interval {
            let poller = FallbackPoller::new(
                domain.clone(),
                cfg.critical_keys_for(domain),
                interval,
                Arc::clone(&self.store),
            );
            tasks.push(tokio::spawn(poller.run(shutdown_tx.subscribe())));
        }

        DomainState {
            count: 0,
            shutdown_tx,
            listener,
            tasks,
        }
    }

    /// Decrement a domain's subscriber count, tearing its tasks down at
    /// zero. No-op for an unknown domain.
    fn release(&self, domain: &Domain) {
        self.store.release_domain(domain);

        match self.domains.get_mut(domain) {
            Some(mut state) => {
                state.count = state.count.saturating_sub(1);
                trace!(domain = %domain, count = state.count, "domain released");
            }
            None => return,
        }

        // Check-and-remove must be one atomic entry operation: an acquire
        // racing in after the decrement bumps the count back up, and the
        // entry (with its live tasks) has to survive for that holder.
        let removed = self.domains.remove_if(domain, |_, state| state.count == 0);
        if let Some((_, state)) = removed {
            let _ = state.shutdown_tx.send(true);
            if let Some(listener) = state.listener {
                listener.close();
            }
            // Tasks exit on the shutdown signal; aborting here would race
            // a listener mid-dispatch.
            drop(state.tasks);
            self.invalidator.cancel(domain);
            *self.epochs.entry(domain.clone()).or_insert(0) += 1;
            info!(domain = %domain, "last subscriber released, domain torn down");
        }
    }

    fn epoch(&self, domain: &Domain) -> u64 {
        self.epochs.get(domain).map(|e| *e).unwrap_or(0)
    }

    /// Consume cache events and refetch invalidated keys for subscribed
    /// domains, writing results back as fresh entries.
    async fn run_refetch_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.subscribe();
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("refetch worker shutting down");
                        return;
                    }
                }
                event = events.recv() => match event {
                    Ok(CacheEvent::Invalidated { key }) => {
                        if self.store.has_subscribers(&key.domain) {
                            self.refetch(&key).await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropped invalidations degrade freshness until the
                        // next poll cycle; nothing to replay.
                        warn!(missed, "refetch worker lagged behind cache events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }

    /// Fetch the first page for a key and write it back. Failures keep
    /// the previous value and mark the entry errored.
    async fn refetch(&self, key: &QueryKey) {
        let request = match PageRequest::for_key(key, self.config.page_size) {
            Ok(request) => request,
            Err(error) => {
                warn!(key = %key, error = %error, "unfetchable key signature");
                return;
            }
        };
        let epoch = self.epoch(&key.domain);
        self.store.mark_fetching(key);

        match self.source.fetch_page(&request).await {
            Ok(page) => {
                if self.epoch(&key.domain) != epoch || !self.store.has_subscribers(&key.domain) {
                    trace!(key = %key, "dropping refetch result for released domain");
                    return;
                }
                let policy = self.config.domain(&key.domain).policy;
                trace!(key = %key, rows = page.rows.len(), "refetched");
                self.store
                    .set(key.clone(), serde_json::Value::Array(page.rows), policy);
            }
            Err(error) => {
                warn!(key = %key, error = %error, "background refetch failed");
                self.store.mark_error(key);
            }
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// One acquisition of a domain. Release is idempotent and also happens
/// on drop, so a handle can never leak its subscription.
pub struct DomainHandle {
    engine: Arc<SyncEngine>,
    domain: Domain,
    released: AtomicBool,
}

impl DomainHandle {
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Release this acquisition. Calling twice is a no-op.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.engine.release(&self.domain);
        }
    }
}

impl Drop for DomainHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    source: Arc<dyn DataSource>,
    channels: Arc<dyn ChannelFactory>,
    config: Option<EngineConfig>,
    store: Option<Arc<QueryCache>>,
}

impl SyncEngineBuilder {
    pub fn new(source: Arc<dyn DataSource>, channels: Arc<dyn ChannelFactory>) -> Self {
        Self {
            source,
            channels,
            config: None,
            store: None,
        }
    }

    /// Use a non-default configuration or profile.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an existing cache instead of creating one.
    pub fn store(mut self, store: Arc<QueryCache>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the engine and spawn its refetch worker and gc sweeper.
    pub fn build(self) -> Arc<SyncEngine> {
        let config = Arc::new(self.config.unwrap_or_default());
        let store = self
            .store
            .unwrap_or_else(|| QueryCache::new(config.max_entries));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let invalidator =
            DebouncedInvalidator::new(Arc::clone(&store), Arc::clone(&config), shutdown_rx.clone());

        let sweep_interval = sweep_interval(&config);
        let _ = store.spawn_sweeper(sweep_interval, shutdown_rx.clone());

        let engine = Arc::new(SyncEngine {
            config,
            store,
            source: self.source,
            channels: self.channels,
            invalidator,
            domains: DashMap::new(),
            epochs: DashMap::new(),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        });
        tokio::spawn(Arc::clone(&engine).run_refetch_worker(shutdown_rx));
        engine
    }
}

/// Half the shortest configured gc time, capped at one minute.
fn sweep_interval(config: &EngineConfig) -> Duration {
    config
        .domains
        .values()
        .map(|d| d.policy.gc_time)
        .chain(std::iter::once(config.fallback.policy.gc_time))
        .min()
        .map(|gc| gc / 2)
        .unwrap_or(MAX_SWEEP_INTERVAL)
        .min(MAX_SWEEP_INTERVAL)
}
