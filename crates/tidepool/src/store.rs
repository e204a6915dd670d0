//! TTL-aware query cache shared by every view in the process.
//!
//! Entries are keyed by domain plus filter signature and carry the
//! policy they were written with. Reads never block: a stale entry is
//! returned as-is and refreshing happens elsewhere (the engine's
//! refetch worker reacts to the events this store broadcasts).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::CachePolicy;
use crate::keys::{Domain, QueryKey};

/// Broadcast capacity for cache events. Bursts beyond this lag the
/// slowest subscriber, which then resynchronizes from the cache itself.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Freshness of an entry at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Within its stale time and not invalidated.
    Fresh,
    /// Past its stale time or explicitly invalidated.
    Stale,
    /// A background refresh is in flight.
    Fetching,
    /// The last refresh failed; the previous value is still served.
    Error,
}

/// Event fan-out for cache subscribers.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// Entry written with a fresh value.
    Updated { key: QueryKey },
    /// Entry marked stale; subscribed domains should refetch.
    Invalidated { key: QueryKey },
    /// Entry removed by gc or capacity pressure.
    Evicted { key: QueryKey },
}

/// A value read from the cache.
#[derive(Debug, Clone)]
pub struct CachedValue {
    pub value: Value,
    pub status: EntryStatus,
    /// Wall-clock time of the last successful write, for "last updated"
    /// staleness indicators.
    pub last_refreshed: DateTime<Utc>,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of reads served from the cache. 0.0 when nothing has
    /// been read yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    value: Value,
    policy: CachePolicy,
    /// Monotonic write time, for stale-time math.
    fetched_at: Instant,
    /// Wall-clock write time, for display.
    last_refreshed: DateTime<Utc>,
    /// Monotonic last read, for LRU and gc.
    last_access: Instant,
    invalidated: bool,
    fetching: bool,
    errored: bool,
}

impl CacheEntry {
    fn status(&self, now: Instant) -> EntryStatus {
        if self.fetching {
            EntryStatus::Fetching
        } else if self.errored {
            EntryStatus::Error
        } else if self.invalidated || now.duration_since(self.fetched_at) >= self.policy.stale_time
        {
            EntryStatus::Stale
        } else {
            EntryStatus::Fresh
        }
    }

    fn gc_deadline(&self) -> Instant {
        self.last_access + self.policy.gc_time
    }
}

/// Process-wide query cache.
///
/// Thread-safe and designed for concurrent access from multiple tasks.
/// Subscriber counts are domain-granular: they gate eviction and tell
/// the refetch worker whether an invalidation is worth acting on.
pub struct QueryCache {
    entries: DashMap<QueryKey, CacheEntry>,
    /// Active subscriber count per domain.
    subscribers: DashMap<Domain, usize>,
    events_tx: broadcast::Sender<CacheEvent>,
    /// Capacity before least-recently-used eviction.
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    /// Create a new empty cache.
    pub fn new(max_entries: usize) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            entries: DashMap::new(),
            subscribers: DashMap::new(),
            events_tx,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Subscribe to cache events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events_tx.subscribe()
    }

    /// Read an entry, if present. Never blocks on freshness: a stale
    /// value is returned immediately.
    pub fn get(&self, key: &QueryKey) -> Option<CachedValue> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(CachedValue {
                    value: entry.value.clone(),
                    status: entry.status(now),
                    last_refreshed: entry.last_refreshed,
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Read an entry and deserialize its value.
    pub fn get_as<T: serde::de::DeserializeOwned>(
        &self,
        key: &QueryKey,
    ) -> Result<Option<T>, serde_json::Error> {
        match self.get(key) {
            Some(cached) => Ok(Some(serde_json::from_value(cached.value)?)),
            None => Ok(None),
        }
    }

    /// Wall-clock time of the last successful write for a key.
    pub fn last_refreshed(&self, key: &QueryKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|e| e.last_refreshed)
    }

    /// Write a fresh value.
    ///
    /// Clears any invalidated/fetching/error state for the key and may
    /// evict the least-recently-used entry when over capacity.
    pub fn set(&self, key: QueryKey, value: Value, policy: CachePolicy) {
        let now = Instant::now();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                policy,
                fetched_at: now,
                last_refreshed: Utc::now(),
                last_access: now,
                invalidated: false,
                fetching: false,
                errored: false,
            },
        );
        self.enforce_capacity(&key);
        self.broadcast(CacheEvent::Updated { key });
    }

    /// Mark one key stale.
    ///
    /// The event is broadcast even when no entry exists yet: subscribed
    /// consumers use it to prime keys they know how to fetch.
    pub fn invalidate(&self, key: &QueryKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.invalidated = true;
        }
        trace!(key = %key, "invalidated");
        self.broadcast(CacheEvent::Invalidated { key: key.clone() });
    }

    /// Mark every entry in a domain stale.
    ///
    /// When the domain has no entries yet, its root key is still
    /// announced so subscribers can prime it.
    pub fn invalidate_domain(&self, domain: &Domain) {
        let keys: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|e| e.key().in_domain(domain))
            .map(|e| e.key().clone())
            .collect();
        if keys.is_empty() {
            self.invalidate(&QueryKey::root(domain.clone()));
            return;
        }
        debug!(domain = %domain, keys = keys.len(), "invalidating domain");
        for key in keys {
            self.invalidate(&key);
        }
    }

    /// Mark every entry matching a predicate stale.
    pub fn invalidate_matching(&self, matches: impl Fn(&QueryKey) -> bool) {
        let keys: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|e| matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.invalidate(&key);
        }
    }

    /// Mark a refresh as in flight for a key.
    pub fn mark_fetching(&self, key: &QueryKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.fetching = true;
        }
    }

    /// Record a failed refresh. The previous value keeps being served.
    pub fn mark_error(&self, key: &QueryKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.fetching = false;
            entry.errored = true;
        }
    }

    /// Remove an entry if its domain has no subscribers and its gc time
    /// has elapsed since last use. Returns whether it was removed.
    pub fn evict(&self, key: &QueryKey) -> bool {
        let now = Instant::now();
        let evictable = match self.entries.get(key) {
            Some(entry) => !self.has_subscribers(&key.domain) && entry.gc_deadline() <= now,
            None => return false,
        };
        if evictable {
            self.remove(key);
        }
        evictable
    }

    /// Evict every entry past its gc deadline with no subscribers.
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|e| e.value().gc_deadline() <= now && !self.has_subscribers(&e.key().domain))
            .map(|e| e.key().clone())
            .collect();
        if !expired.is_empty() {
            debug!(count = expired.len(), "sweeping expired entries");
        }
        for key in expired {
            self.remove(&key);
        }
    }

    /// Run the gc sweep on an interval until shutdown.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("cache sweeper shutting down");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        cache.sweep();
                    }
                }
            }
        })
    }

    /// Increment the subscriber count for a domain.
    pub fn retain_domain(&self, domain: &Domain) {
        *self.subscribers.entry(domain.clone()).or_insert(0) += 1;
    }

    /// Decrement the subscriber count for a domain.
    pub fn release_domain(&self, domain: &Domain) {
        if let Some(mut count) = self.subscribers.get_mut(domain) {
            *count = count.saturating_sub(1);
        }
    }

    /// Whether any subscriber currently holds the domain.
    pub fn has_subscribers(&self, domain: &Domain) -> bool {
        self.subscribers.get(domain).is_some_and(|c| *c > 0)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn remove(&self, key: &QueryKey) {
        if self.entries.remove(key).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.broadcast(CacheEvent::Evicted { key: key.clone() });
        }
    }

    /// Evict the least-recently-used entry while over capacity, never
    /// the one just written.
    fn enforce_capacity(&self, just_written: &QueryKey) {
        while self.entries.len() > self.max_entries {
            let lru = self
                .entries
                .iter()
                .filter(|e| e.key() != just_written)
                .min_by_key(|e| e.value().last_access)
                .map(|e| e.key().clone());
            match lru {
                Some(key) => {
                    debug!(key = %key, "evicting over capacity");
                    self.remove(&key);
                }
                None => break,
            }
        }
    }

    fn broadcast(&self, event: CacheEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("no subscribers for cache event");
        }
    }
}
