//! End-to-end engine tests: change events through debounced invalidation
//! to the refetch worker, the polling staleness bound, and subscription
//! leak-freedom.
//!
//! All timing runs on tokio's paused clock, so the assertions on exact
//! firing times are deterministic.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

use tidepool::{
    CONTACTS_DOMAIN, ChangeEvent, ChangeKind, ChannelFactory, ChannelState, DataSource, Domain,
    DomainConfig, EngineConfig, EngineError, Mutation, Page, PageRequest, QueryKey, SourceError,
    SyncEngine,
};

/// Counter-backed data source: every fetch returns the current version
/// number so tests can observe which refresh produced a cache entry.
struct VersionedSource {
    versions: DashMap<Domain, usize>,
    fetches: AtomicUsize,
}

impl VersionedSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            versions: DashMap::new(),
            fetches: AtomicUsize::new(0),
        })
    }

    fn bump(&self, domain: &str) {
        *self.versions.entry(Domain::from(domain)).or_insert(0) += 1;
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for VersionedSource {
    async fn fetch_page(&self, req: &PageRequest) -> Result<Page, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let version = self.versions.get(&req.domain).map(|v| *v).unwrap_or(0);
        Ok(Page {
            rows: vec![json!({"version": version})],
            next_cursor: None,
            has_more: false,
        })
    }

    async fn mutate(&self, _domain: &Domain, _m: Mutation) -> Result<Value, SourceError> {
        Err(SourceError::Backend {
            code: 501,
            message: "reads only".to_string(),
        })
    }
}

/// Channel factory that exposes the sender side to the test, so change
/// events can be injected (or withheld, to simulate a dead channel).
struct TestChannels {
    senders: DashMap<Domain, mpsc::Sender<ChangeEvent>>,
}

impl TestChannels {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: DashMap::new(),
        })
    }

    async fn emit(&self, domain: &str, kind: ChangeKind) {
        let domain = Domain::from(domain);
        let sender = self
            .senders
            .get(&domain)
            .expect("channel not open")
            .clone();
        sender
            .send(ChangeEvent {
                domain,
                kind,
                row_id: None,
            })
            .await
            .expect("listener gone");
    }
}

#[async_trait]
impl ChannelFactory for TestChannels {
    async fn open(&self, domain: &Domain) -> Result<mpsc::Receiver<ChangeEvent>, SourceError> {
        let (tx, rx) = mpsc::channel(16);
        self.senders.insert(domain.clone(), tx);
        Ok(rx)
    }
}

fn build_engine(
    config: EngineConfig,
) -> (Arc<SyncEngine>, Arc<VersionedSource>, Arc<TestChannels>) {
    let source = VersionedSource::new();
    let channels = TestChannels::new();
    let engine = SyncEngine::builder(
        Arc::clone(&source) as Arc<dyn DataSource>,
        Arc::clone(&channels) as Arc<dyn ChannelFactory>,
    )
    .config(config)
    .build();
    (engine, source, channels)
}

/// Config with no polling, so only the channel path can invalidate.
fn channel_only_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.fallback.poll_interval = None;
    for cfg in config.domains.values_mut() {
        cfg.poll_interval = None;
    }
    config
}

#[tokio::test(start_paused = true)]
async fn burst_of_events_refreshes_exactly_once_at_last_plus_window() {
    let (engine, source, channels) = build_engine(channel_only_config());
    let _handle = engine.acquire(CONTACTS_DOMAIN);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(source.fetches(), 0);

    // Signals at t=0, 200, 400, 900 with a 1000 ms window: the single
    // invalidation (and refetch) lands at t=1900.
    let start = Instant::now();
    channels.emit(CONTACTS_DOMAIN, ChangeKind::Update).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    channels.emit(CONTACTS_DOMAIN, ChangeKind::Update).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    channels.emit(CONTACTS_DOMAIN, ChangeKind::Update).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    channels.emit(CONTACTS_DOMAIN, ChangeKind::Update).await;

    let mut events = engine.subscribe();
    loop {
        if let tidepool::CacheEvent::Invalidated { key } = events.recv().await.unwrap() {
            assert_eq!(key, QueryKey::root(CONTACTS_DOMAIN));
            break;
        }
    }
    assert_eq!(start.elapsed(), Duration::from_millis(1900));

    // Let the refetch settle; no further invalidations follow.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(source.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn structural_event_refreshes_linked_domains_too() {
    let (engine, _source, channels) = build_engine(channel_only_config());
    let contacts = engine.acquire(CONTACTS_DOMAIN);
    tokio::time::sleep(Duration::from_millis(1)).await;

    channels.emit(CONTACTS_DOMAIN, ChangeKind::Insert).await;
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert!(engine.has_pending_invalidation(&Domain::from(CONTACTS_DOMAIN)));
    assert!(engine.has_pending_invalidation(&Domain::from("client-stats")));
    assert!(engine.has_pending_invalidation(&Domain::from("dashboard-metrics")));
    drop(contacts);
}

#[tokio::test(start_paused = true)]
async fn field_update_never_fans_out() {
    let (engine, _source, channels) = build_engine(channel_only_config());
    let _handle = engine.acquire(CONTACTS_DOMAIN);
    tokio::time::sleep(Duration::from_millis(1)).await;

    channels.emit(CONTACTS_DOMAIN, ChangeKind::Update).await;
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert!(engine.has_pending_invalidation(&Domain::from(CONTACTS_DOMAIN)));
    assert!(!engine.has_pending_invalidation(&Domain::from("client-stats")));
    assert!(!engine.has_pending_invalidation(&Domain::from("dashboard-metrics")));
}

#[tokio::test(start_paused = true)]
async fn polling_bounds_staleness_with_a_silent_channel() {
    // Channel opens but never delivers; the 30 s backstop is the only
    // path to freshness.
    let config = EngineConfig::default().with_domain(
        CONTACTS_DOMAIN,
        DomainConfig {
            poll_interval: Some(Duration::from_secs(30)),
            critical_keys: vec![QueryKey::root(CONTACTS_DOMAIN)],
            linked: vec![],
            ..DomainConfig::default()
        },
    );
    let (engine, source, _channels) = build_engine(config);
    let _handle = engine.acquire(CONTACTS_DOMAIN);
    tokio::time::sleep(Duration::from_millis(1)).await;

    // A server-side change the channel never reports.
    source.bump(CONTACTS_DOMAIN);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let cached = engine
        .store()
        .get(&QueryKey::root(CONTACTS_DOMAIN))
        .expect("poll refreshed the critical key");
    assert_eq!(cached.value, json!([{"version": 1}]));

    // Another change, another bounded cycle.
    source.bump(CONTACTS_DOMAIN);
    tokio::time::sleep(Duration::from_secs(30)).await;
    let cached = engine
        .store()
        .get(&QueryKey::root(CONTACTS_DOMAIN))
        .unwrap();
    assert_eq!(cached.value, json!([{"version": 2}]));
}

#[tokio::test(start_paused = true)]
async fn acquire_twice_release_once_keeps_the_channel_open() {
    let (engine, _source, _channels) = build_engine(channel_only_config());
    let domain = Domain::from(CONTACTS_DOMAIN);

    let first = engine.acquire(CONTACTS_DOMAIN);
    let second = engine.acquire(CONTACTS_DOMAIN);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(engine.channel_state(&domain), Some(ChannelState::Active));

    first.release();
    assert_eq!(engine.channel_state(&domain), Some(ChannelState::Active));
    assert_eq!(engine.subscriber_count(&domain), 1);

    second.release();
    assert_eq!(engine.channel_state(&domain), None);
    assert_eq!(engine.subscriber_count(&domain), 0);
    assert!(!engine.store().has_subscribers(&domain));
    assert!(!engine.has_pending_invalidation(&domain));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_release_never_strands_a_live_subscriber() {
    let (engine, _source, channels) = build_engine(channel_only_config());
    let domain = Domain::from(CONTACTS_DOMAIN);

    // Hammer the same domain from several threads so releases that
    // observe a zero count interleave with fresh acquires. A teardown
    // racing one of those acquires would leave its handle holding a
    // domain with no channel and no timers.
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            for _ in 0..200 {
                let handle = engine.acquire(CONTACTS_DOMAIN);
                tokio::task::yield_now().await;
                handle.release();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(engine.subscriber_count(&domain), 0);

    // The domain must come back fully wired: the listener connects and
    // change events still reach the invalidator.
    let _handle = engine.acquire(CONTACTS_DOMAIN);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.channel_state(&domain), Some(ChannelState::Active));

    channels.emit(CONTACTS_DOMAIN, ChangeKind::Update).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.has_pending_invalidation(&domain));
}

#[tokio::test(start_paused = true)]
async fn release_cancels_pending_debounce() {
    let (engine, source, channels) = build_engine(channel_only_config());
    let handle = engine.acquire(CONTACTS_DOMAIN);
    tokio::time::sleep(Duration::from_millis(1)).await;

    channels.emit(CONTACTS_DOMAIN, ChangeKind::Update).await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(engine.has_pending_invalidation(&Domain::from(CONTACTS_DOMAIN)));

    handle.release();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(source.fetches(), 0, "cancelled timer must not fire");
}

#[tokio::test(start_paused = true)]
async fn in_flight_results_are_dropped_after_release() {
    /// Fetch that answers only after a delay, so a release can race it.
    struct SlowSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DataSource for SlowSource {
        async fn fetch_page(&self, _req: &PageRequest) -> Result<Page, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Page {
                rows: vec![json!({"late": true})],
                next_cursor: None,
                has_more: false,
            })
        }
        async fn mutate(&self, _d: &Domain, _m: Mutation) -> Result<Value, SourceError> {
            unreachable!()
        }
    }

    let source = Arc::new(SlowSource {
        fetches: AtomicUsize::new(0),
    });
    let channels = TestChannels::new();
    let engine = SyncEngine::builder(
        Arc::clone(&source) as Arc<dyn DataSource>,
        channels as Arc<dyn ChannelFactory>,
    )
    .config(channel_only_config())
    .build();

    let handle = engine.acquire(CONTACTS_DOMAIN);
    tokio::time::sleep(Duration::from_millis(1)).await;
    engine.store().invalidate(&QueryKey::root(CONTACTS_DOMAIN));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

    // Release while the fetch is still in flight.
    handle.release();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let cached = engine.store().get(&QueryKey::root(CONTACTS_DOMAIN));
    assert!(
        cached.is_none(),
        "stale response applied to a released domain"
    );
}

#[tokio::test(start_paused = true)]
async fn stream_poll_merges_server_side_appends() {
    use tidepool::{Role, StreamKey};

    /// Conversation log that grows once, mid-test.
    struct GrowingSource {
        rows: DashMap<usize, Value>,
    }

    impl GrowingSource {
        fn push(&self, seq: usize) {
            self.rows.insert(
                seq,
                json!({
                    "id": format!("m{}", seq),
                    "role": "assistant",
                    "content": "reply",
                    "created_at": chrono::Utc::now(),
                }),
            );
        }
    }

    #[async_trait]
    impl DataSource for GrowingSource {
        async fn fetch_page(&self, _req: &PageRequest) -> Result<Page, SourceError> {
            let mut seqs: Vec<usize> = self.rows.iter().map(|e| *e.key()).collect();
            seqs.sort_unstable();
            Ok(Page {
                rows: seqs.iter().map(|s| self.rows.get(s).unwrap().clone()).collect(),
                next_cursor: None,
                has_more: false,
            })
        }
        async fn mutate(&self, _d: &Domain, _m: Mutation) -> Result<Value, SourceError> {
            Err(SourceError::Backend {
                code: 501,
                message: "reads only".to_string(),
            })
        }
    }

    let source = Arc::new(GrowingSource {
        rows: DashMap::new(),
    });
    source.push(0);
    let channels = TestChannels::new();
    let mut config = channel_only_config();
    config.stream_poll_interval = Some(Duration::from_secs(5));
    let engine = SyncEngine::builder(
        Arc::clone(&source) as Arc<dyn DataSource>,
        channels as Arc<dyn ChannelFactory>,
    )
    .config(config)
    .build();

    let stream = engine.open_stream(StreamKey::new("conversations", "s1"));
    stream.load_initial().await.unwrap();
    assert_eq!(stream.snapshot().await.items.len(), 1);

    source.push(1);
    tokio::time::sleep(Duration::from_secs(6)).await;

    let snapshot = stream.snapshot().await;
    assert_eq!(snapshot.items.len(), 2);
    assert!(snapshot.items.iter().all(|i| i.role == Role::Assistant));

    // Disposal is a lifecycle no-op boundary: later polls stop quietly.
    stream.dispose();
    source.push(2);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(stream.snapshot().await.items.len(), 2);
    assert!(matches!(
        stream.load_more().await,
        Err(EngineError::ShutDown)
    ));
}
