//! Engine configuration: cache policies, per-domain tuning, and
//! consumer profiles.
//!
//! All values are supplied at engine construction; there is no on-disk
//! format. The named profiles reproduce the tuning the product ships
//! with: `default` for ordinary views, `dashboard` for metric-heavy
//! screens that want snappier coalescing, `background` for low-priority
//! views that should barely touch the network.

use std::collections::HashMap;
use std::time::Duration;

use crate::keys::{
    APPOINTMENTS_DOMAIN, CLIENT_STATS_DOMAIN, CONTACTS_DOMAIN, CONVERSATION_METRICS_DOMAIN,
    CONVERSATIONS_DOMAIN, DASHBOARD_METRICS_DOMAIN, Domain, QueryKey,
};

/// Default quiet window for coalescing change signals.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(1000);

/// Default polling backstop interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default page size for paginated streams.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Number of most-recent items a background stream poll fetches.
pub const DEFAULT_LATEST_WINDOW: usize = 20;

/// Default interval between background stream polls.
pub const DEFAULT_STREAM_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default cache capacity before least-recently-used eviction kicks in.
pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// How long an entry stays fresh and how long an unused entry is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Time before a fresh entry becomes stale.
    pub stale_time: Duration,
    /// Time an entry with no subscribers is kept before eviction.
    pub gc_time: Duration,
}

impl CachePolicy {
    /// Data the UI cannot render without (client lists, kanban columns).
    pub const CRITICAL: Self = Self {
        stale_time: Duration::from_secs(10 * 60),
        gc_time: Duration::from_secs(20 * 60),
    };

    /// Near-static reference data (service catalogs, personality config).
    pub const REFERENCE: Self = Self {
        stale_time: Duration::from_secs(15 * 60),
        gc_time: Duration::from_secs(30 * 60),
    };

    /// Frequently-edited working data.
    pub const DYNAMIC: Self = Self {
        stale_time: Duration::from_secs(5 * 60),
        gc_time: Duration::from_secs(10 * 60),
    };

    /// Aggregated metrics; recomputed often, cheap to refetch.
    pub const METRICS: Self = Self {
        stale_time: Duration::from_secs(2 * 60),
        gc_time: Duration::from_secs(5 * 60),
    };

    /// Live views that go stale almost immediately.
    pub const REALTIME: Self = Self {
        stale_time: Duration::from_secs(30),
        gc_time: Duration::from_secs(2 * 60),
    };
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::DYNAMIC
    }
}

/// Per-domain tuning.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub policy: CachePolicy,
    /// Quiet window for coalescing change signals.
    pub debounce_window: Duration,
    /// Polling backstop interval. `None` disables polling for the
    /// domain.
    pub poll_interval: Option<Duration>,
    /// Whether acquiring the domain opens a change-notification channel.
    pub channel: bool,
    /// Keys the polling backstop invalidates. Empty means the domain's
    /// root key.
    pub critical_keys: Vec<QueryKey>,
    /// Domains invalidated alongside this one on structural
    /// (insert/delete) changes. Field updates never fan out.
    pub linked: Vec<Domain>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            policy: CachePolicy::default(),
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            poll_interval: Some(DEFAULT_POLL_INTERVAL),
            channel: true,
            critical_keys: Vec::new(),
            linked: Vec::new(),
        }
    }
}

impl DomainConfig {
    /// Keys the polling backstop should invalidate for `domain`.
    pub fn critical_keys_for(&self, domain: &Domain) -> Vec<QueryKey> {
        if self.critical_keys.is_empty() {
            vec![QueryKey::root(domain.clone())]
        } else {
            self.critical_keys.clone()
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-domain overrides. Domains not listed use `fallback`.
    pub domains: HashMap<Domain, DomainConfig>,
    /// Tuning for domains without an explicit entry.
    pub fallback: DomainConfig,
    /// Page size for paginated streams.
    pub page_size: usize,
    /// Most-recent items fetched by a background stream poll.
    pub latest_window: usize,
    /// Interval between background stream polls. `None` disables them.
    pub stream_poll_interval: Option<Duration>,
    /// Cache capacity before least-recently-used eviction.
    pub max_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut domains = HashMap::new();

        domains.insert(
            Domain::from(CONTACTS_DOMAIN),
            DomainConfig {
                policy: CachePolicy::DYNAMIC,
                critical_keys: vec![
                    QueryKey::root(CLIENT_STATS_DOMAIN),
                    QueryKey::root(DASHBOARD_METRICS_DOMAIN),
                ],
                linked: vec![
                    Domain::from(CLIENT_STATS_DOMAIN),
                    Domain::from(DASHBOARD_METRICS_DOMAIN),
                ],
                ..DomainConfig::default()
            },
        );
        domains.insert(
            Domain::from(APPOINTMENTS_DOMAIN),
            DomainConfig {
                policy: CachePolicy::DYNAMIC,
                linked: vec![Domain::from(CONTACTS_DOMAIN)],
                ..DomainConfig::default()
            },
        );
        domains.insert(
            Domain::from(CONVERSATIONS_DOMAIN),
            DomainConfig {
                policy: CachePolicy::REALTIME,
                linked: vec![Domain::from(CONVERSATION_METRICS_DOMAIN)],
                ..DomainConfig::default()
            },
        );
        domains.insert(
            Domain::from(CLIENT_STATS_DOMAIN),
            DomainConfig {
                policy: CachePolicy::METRICS,
                channel: false,
                ..DomainConfig::default()
            },
        );
        domains.insert(
            Domain::from(DASHBOARD_METRICS_DOMAIN),
            DomainConfig {
                policy: CachePolicy::METRICS,
                channel: false,
                ..DomainConfig::default()
            },
        );
        domains.insert(
            Domain::from(CONVERSATION_METRICS_DOMAIN),
            DomainConfig {
                policy: CachePolicy::METRICS,
                channel: false,
                ..DomainConfig::default()
            },
        );

        Self {
            domains,
            fallback: DomainConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
            latest_window: DEFAULT_LATEST_WINDOW,
            stream_poll_interval: Some(DEFAULT_STREAM_POLL_INTERVAL),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl EngineConfig {
    /// Profile for metric-heavy dashboard views: tighter coalescing so
    /// bursts settle quickly.
    pub fn dashboard() -> Self {
        let mut config = Self::default();
        config.set_all_debounce(Duration::from_millis(500));
        config
    }

    /// Profile for low-priority background views: wide coalescing, slow
    /// polling, no conversation channel.
    pub fn background() -> Self {
        let mut config = Self::default();
        config.set_all_debounce(Duration::from_millis(2000));
        config.set_all_poll(Some(Duration::from_secs(60)));
        if let Some(conversations) = config
            .domains
            .get_mut(&Domain::from(CONVERSATIONS_DOMAIN))
        {
            conversations.channel = false;
        }
        config
    }

    /// Tuning for a domain, falling back to the default entry.
    pub fn domain(&self, domain: &Domain) -> &DomainConfig {
        self.domains.get(domain).unwrap_or(&self.fallback)
    }

    /// Insert or replace a domain's tuning.
    pub fn with_domain(mut self, domain: impl Into<Domain>, cfg: DomainConfig) -> Self {
        self.domains.insert(domain.into(), cfg);
        self
    }

    fn set_all_debounce(&mut self, window: Duration) {
        self.fallback.debounce_window = window;
        for cfg in self.domains.values_mut() {
            cfg.debounce_window = window;
        }
    }

    fn set_all_poll(&mut self, interval: Option<Duration>) {
        self.fallback.poll_interval = interval;
        for cfg in self.domains.values_mut() {
            cfg.poll_interval = interval;
        }
    }
}
