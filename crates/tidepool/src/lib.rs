//! Client-side realtime synchronization and cache-consistency engine.
//!
//! Serves paginated, cached views of frequently-changing server data and
//! keeps them consistent by merging live change notifications with a
//! periodic polling backstop.
//!
//! ## Components
//!
//! - **Query cache**: TTL-aware store of query results with
//!   stale-while-revalidate reads, LRU capacity, and gc sweeping
//! - **Debounced invalidator**: coalesces bursts of change signals into
//!   one invalidation per domain per quiet window
//! - **Change listener**: per-domain notification channel feeding the
//!   invalidator, with asymmetric fan-out to linked domains
//! - **Polling backstop**: fixed-interval invalidation that bounds
//!   staleness even when the channel is silently dead
//! - **Stream controller**: ordered, deduplicated message sequences with
//!   backward pagination and optimistic sends
//! - **Sync engine**: reference-counted domain subscriptions owning all
//!   channels and timers, plus the background refetch worker

pub mod config;
pub mod debounce;
pub mod engine;
mod error;
pub mod keys;
pub mod listener;
pub mod poller;
pub mod source;
pub mod store;
pub mod stream;

pub use config::{CachePolicy, DomainConfig, EngineConfig};
pub use debounce::DebouncedInvalidator;
pub use engine::{DomainHandle, SyncEngine, SyncEngineBuilder};
pub use error::{EngineError, SourceError};
pub use keys::{
    APPOINTMENTS_DOMAIN, CLIENT_STATS_DOMAIN, CONTACTS_DOMAIN, CONVERSATION_METRICS_DOMAIN,
    CONVERSATIONS_DOMAIN, Cursor, DASHBOARD_METRICS_DOMAIN, Domain, QueryKey,
};
pub use listener::{ChangeListener, ChannelState};
pub use poller::FallbackPoller;
pub use source::{ChangeEvent, ChangeKind, ChannelFactory, DataSource, Mutation, Page, PageRequest};
pub use store::{CacheEvent, CacheStats, CachedValue, EntryStatus, QueryCache};
pub use stream::{
    ItemId, LoadKind, Role, StreamController, StreamItem, StreamKey, StreamPhase, StreamSnapshot,
};
