//! Debounced invalidation: bursts of change signals collapse into one
//! cache invalidation per domain per quiet window.
//!
//! Each domain has at most one live timer. A new signal moves the
//! timer's deadline instead of adding a second timer, so N signals
//! inside the window produce exactly one invalidation, fired at
//! (last signal + window).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::keys::Domain;
use crate::store::QueryCache;

struct Pending {
    deadline: Instant,
}

/// Coalesces invalidation signals per domain.
pub struct DebouncedInvalidator {
    store: Arc<QueryCache>,
    config: Arc<EngineConfig>,
    pending: DashMap<Domain, Pending>,
    last_fired: DashMap<Domain, DateTime<Utc>>,
    shutdown: watch::Receiver<bool>,
}

impl DebouncedInvalidator {
    pub fn new(
        store: Arc<QueryCache>,
        config: Arc<EngineConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            pending: DashMap::new(),
            last_fired: DashMap::new(),
            shutdown,
        })
    }

    /// Record intent to invalidate a domain.
    ///
    /// Starts the domain's timer if none is live, otherwise pushes its
    /// deadline out to now + window.
    pub fn signal(self: &Arc<Self>, domain: &Domain) {
        let window = self.config.domain(domain).debounce_window;
        let deadline = Instant::now() + window;

        match self.pending.entry(domain.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().deadline = deadline;
                trace!(domain = %domain, "debounce timer reset");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Pending { deadline });
                trace!(domain = %domain, window_ms = window.as_millis() as u64, "debounce timer started");
                self.spawn_timer(domain.clone());
            }
        }
    }

    /// Cancel a domain's pending timer without firing.
    pub fn cancel(&self, domain: &Domain) {
        if self.pending.remove(domain).is_some() {
            debug!(domain = %domain, "pending invalidation cancelled");
        }
    }

    /// Number of domains with a live timer.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a domain has a live timer.
    pub fn has_pending(&self, domain: &Domain) -> bool {
        self.pending.contains_key(domain)
    }

    /// Wall-clock time the domain's invalidation last fired.
    pub fn last_fired(&self, domain: &Domain) -> Option<DateTime<Utc>> {
        self.last_fired.get(domain).map(|t| *t)
    }

    /// One timer task per domain with a pending signal. Exits when the
    /// entry disappears (cancelled) or after firing once.
    fn spawn_timer(self: &Arc<Self>, domain: Domain) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let deadline = match this.pending.get(&domain) {
                    Some(pending) => pending.deadline,
                    None => return,
                };

                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            this.pending.remove(&domain);
                            return;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        // The deadline may have moved while we slept. The
                        // re-check and the removal are one atomic entry
                        // operation: a signal racing in keeps the entry,
                        // and the loop re-arms to its new deadline.
                        let now = Instant::now();
                        let expired = this
                            .pending
                            .remove_if(&domain, |_, pending| pending.deadline <= now);
                        if expired.is_none() {
                            // Cancelled (loop exits at the top) or reset.
                            continue;
                        }
                        this.last_fired.insert(domain.clone(), Utc::now());
                        debug!(domain = %domain, "debounced invalidation firing");
                        this.store.invalidate_domain(&domain);
                        return;
                    }
                }
            }
        });
    }
}
