//! Paginated stream controller: one ordered, deduplicated message
//! sequence per conversation, with backward pagination, background
//! merge of newly-observed items, and optimistic sends.
//!
//! Merging is a set union keyed by id. Items already present are never
//! overwritten, so an optimistic item that has not been confirmed yet
//! survives any number of poll cycles that have not observed its
//! server id.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::{EngineError, SourceError};
use crate::keys::{Cursor, Domain};
use crate::source::{DataSource, Mutation, Page, PageRequest};

/// Identity of a stream item.
///
/// Optimistic items carry a locally-generated temporary id until the
/// server confirms them; the temporary id is retired on confirmation
/// and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemId {
    /// Local item awaiting confirmation.
    Pending(uuid::Uuid),
    /// Server-assigned id.
    Confirmed(String),
}

impl ItemId {
    pub fn is_pending(&self) -> bool {
        matches!(self, ItemId::Pending(_))
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemId::Pending(uuid) => write!(f, "temp-{}", uuid),
            ItemId::Confirmed(id) => write!(f, "{}", id),
        }
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a conversation stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub id: ItemId,
    pub role: Role,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    /// True while optimistic, false once server-confirmed.
    pub pending: bool,
}

/// Wire shape of a message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRow {
    id: String,
    role: Role,
    content: String,
    created_at: DateTime<Utc>,
}

impl StreamItem {
    /// Decode a server row into a confirmed item.
    pub fn from_row(row: &Value) -> Result<Self, serde_json::Error> {
        let row: MessageRow = serde_json::from_value(row.clone())?;
        Ok(Self {
            id: ItemId::Confirmed(row.id),
            role: row.role,
            content: row.content,
            sent_at: row.created_at,
            pending: false,
        })
    }
}

/// Identity of one logical stream: a domain plus the conversation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub domain: Domain,
    pub session_id: String,
}

impl StreamKey {
    pub fn new(domain: impl Into<Domain>, session_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            session_id: session_id.into(),
        }
    }

    /// Backend filter selecting this stream's rows.
    pub fn filter(&self) -> Value {
        json!({ "session_id": self.session_id })
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.session_id)
    }
}

/// What a load is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Initial,
    Append,
    Replace,
}

/// Stream lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Nothing loaded yet.
    Idle,
    Loading(LoadKind),
    Ready,
}

/// What views observe.
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub phase: StreamPhase,
    pub items: Arc<Vec<StreamItem>>,
    pub has_more: bool,
}

struct StreamState {
    items: Vec<StreamItem>,
    cursor: Option<Cursor>,
    has_more: bool,
    phase: StreamPhase,
}

/// Controller for one conversation's message sequence.
pub struct StreamController {
    key: StreamKey,
    source: Arc<dyn DataSource>,
    page_size: usize,
    latest_window: usize,
    state: RwLock<StreamState>,
    snapshot_tx: watch::Sender<StreamSnapshot>,
    /// Bumped on refresh and dispose; in-flight results whose epoch no
    /// longer matches are dropped instead of applied.
    epoch: AtomicU64,
    disposed: AtomicBool,
}

impl StreamController {
    pub fn new(
        key: StreamKey,
        source: Arc<dyn DataSource>,
        page_size: usize,
        latest_window: usize,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(StreamSnapshot {
            phase: StreamPhase::Idle,
            items: Arc::new(Vec::new()),
            has_more: false,
        });
        Arc::new(Self {
            key,
            source,
            page_size,
            latest_window,
            state: RwLock::new(StreamState {
                items: Vec::new(),
                cursor: None,
                has_more: false,
                phase: StreamPhase::Idle,
            }),
            snapshot_tx,
            epoch: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Observe snapshots. The receiver always holds the latest state.
    pub fn watch(&self) -> watch::Receiver<StreamSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Current state, for callers outside a watch loop.
    pub async fn snapshot(&self) -> StreamSnapshot {
        let state = self.state.read().await;
        Self::snapshot_of(&state)
    }

    /// Stop applying results. Idempotent; in-flight fetches and sends
    /// complete but their results are discarded.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            debug!(stream = %self.key, "stream disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Load the most recent page into an empty stream.
    ///
    /// No-op when a load is already running. On failure the stream
    /// returns to idle so the caller can retry.
    pub async fn load_initial(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.is_disposed() {
            return Err(EngineError::ShutDown);
        }
        {
            let mut state = self.state.write().await;
            if matches!(state.phase, StreamPhase::Loading(_)) {
                return Ok(());
            }
            state.phase = StreamPhase::Loading(LoadKind::Initial);
            self.publish(&state);
        }
        let epoch = self.epoch.load(Ordering::SeqCst);

        let request = self.page_request(None, self.page_size);
        match self.source.fetch_page(&request).await {
            Ok(page) => {
                let items = decode_rows(&page.rows);
                let mut state = self.state.write().await;
                if !self.still_live(epoch) {
                    return Ok(());
                }
                state.items = items;
                sort_items(&mut state.items);
                state.cursor = self.next_cursor(&page, &state.items);
                state.has_more = page_filled(&page, self.page_size);
                state.phase = StreamPhase::Ready;
                trace!(stream = %self.key, count = state.items.len(), "initial page loaded");
                self.publish(&state);
                Ok(())
            }
            Err(error) => {
                let mut state = self.state.write().await;
                if self.still_live(epoch) {
                    state.phase = StreamPhase::Idle;
                    self.publish(&state);
                }
                Err(self.fetch_error(error))
            }
        }
    }

    /// Fetch the page older than the earliest loaded item and merge it.
    ///
    /// No-op while another load runs or when the stream is exhausted.
    pub async fn load_more(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.is_disposed() {
            return Err(EngineError::ShutDown);
        }
        let cursor = {
            let mut state = self.state.write().await;
            if matches!(state.phase, StreamPhase::Loading(_)) || !state.has_more {
                return Ok(());
            }
            state.phase = StreamPhase::Loading(LoadKind::Append);
            self.publish(&state);
            state.cursor.clone()
        };
        let epoch = self.epoch.load(Ordering::SeqCst);

        let request = self.page_request(cursor, self.page_size);
        match self.source.fetch_page(&request).await {
            Ok(page) => {
                let incoming = decode_rows(&page.rows);
                let mut state = self.state.write().await;
                if !self.still_live(epoch) {
                    return Ok(());
                }
                let added = merge_items(&mut state.items, incoming);
                state.cursor = self.next_cursor(&page, &state.items);
                state.has_more = page_filled(&page, self.page_size);
                state.phase = StreamPhase::Ready;
                debug!(stream = %self.key, added, has_more = state.has_more, "older page merged");
                self.publish(&state);
                Ok(())
            }
            Err(error) => {
                let mut state = self.state.write().await;
                if self.still_live(epoch) {
                    state.phase = StreamPhase::Ready;
                    self.publish(&state);
                }
                Err(self.fetch_error(error))
            }
        }
    }

    /// Re-fetch the most recent page and replace the sequence.
    ///
    /// Used on stream-identity change; unconfirmed optimistic items are
    /// discarded with everything else.
    pub async fn refresh(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.is_disposed() {
            return Err(EngineError::ShutDown);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state.write().await;
            state.phase = StreamPhase::Loading(LoadKind::Replace);
            self.publish(&state);
        }

        let request = self.page_request(None, self.page_size);
        match self.source.fetch_page(&request).await {
            Ok(page) => {
                let items = decode_rows(&page.rows);
                let mut state = self.state.write().await;
                if !self.still_live(epoch) {
                    return Ok(());
                }
                state.items = items;
                sort_items(&mut state.items);
                state.cursor = self.next_cursor(&page, &state.items);
                state.has_more = page_filled(&page, self.page_size);
                state.phase = StreamPhase::Ready;
                debug!(stream = %self.key, count = state.items.len(), "stream replaced");
                self.publish(&state);
                Ok(())
            }
            Err(error) => {
                let mut state = self.state.write().await;
                if self.still_live(epoch) {
                    state.phase = StreamPhase::Ready;
                    self.publish(&state);
                }
                Err(self.fetch_error(error))
            }
        }
    }

    /// Fetch the latest few items and merge any unseen ones. Runs in
    /// the background; never touches the phase.
    pub async fn poll_latest(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.is_disposed() {
            return Err(EngineError::ShutDown);
        }
        let epoch = self.epoch.load(Ordering::SeqCst);

        let request = self.page_request(None, self.latest_window);
        let page = self
            .source
            .fetch_page(&request)
            .await
            .map_err(|e| self.fetch_error(e))?;
        let incoming = decode_rows(&page.rows);

        let mut state = self.state.write().await;
        if !self.still_live(epoch) {
            return Ok(());
        }
        let added = merge_items(&mut state.items, incoming);
        if added > 0 {
            trace!(stream = %self.key, added, "poll merged new items");
            self.publish(&state);
        }
        Ok(())
    }

    /// Append an optimistic item and confirm it against the backend.
    ///
    /// On success the temporary item is replaced in place by the
    /// confirmed one; on failure it is removed and the error returned.
    pub async fn send(self: &Arc<Self>, role: Role, content: String) -> Result<StreamItem, EngineError> {
        if self.is_disposed() {
            return Err(EngineError::ShutDown);
        }
        let temp_id = ItemId::Pending(uuid::Uuid::new_v4());
        let item = StreamItem {
            id: temp_id.clone(),
            role,
            content: content.clone(),
            sent_at: Utc::now(),
            pending: true,
        };
        let epoch = self.epoch.load(Ordering::SeqCst);
        {
            let mut state = self.state.write().await;
            state.items.push(item.clone());
            self.publish(&state);
        }

        let row = json!({
            "session_id": self.key.session_id,
            "role": item.role,
            "content": item.content,
            "created_at": item.sent_at,
        });
        let result = self
            .source
            .mutate(&self.key.domain, Mutation::Insert { row })
            .await;

        match result {
            Ok(confirmed_row) => {
                let confirmed = StreamItem::from_row(&confirmed_row)?;
                let mut state = self.state.write().await;
                if self.still_live(epoch) {
                    reconcile(&mut state.items, &temp_id, confirmed.clone());
                    self.publish(&state);
                }
                Ok(confirmed)
            }
            Err(error) => {
                warn!(stream = %self.key, error = %error, "send failed, rolling back");
                let mut state = self.state.write().await;
                if self.still_live(epoch) {
                    state.items.retain(|i| i.id != temp_id);
                    self.publish(&state);
                }
                Err(EngineError::Send(error))
            }
        }
    }

    /// Poll the latest window on an interval until shutdown.
    pub fn spawn_poller(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let stream = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        if stream.is_disposed() {
                            return;
                        }
                        if let Err(error) = stream.poll_latest().await {
                            // Next cycle is independent; freshness degrades
                            // until the backend answers again.
                            warn!(stream = %stream.key, error = %error, "stream poll failed");
                        }
                    }
                }
            }
        })
    }

    fn page_request(&self, before: Option<Cursor>, limit: usize) -> PageRequest {
        PageRequest {
            domain: self.key.domain.clone(),
            filter: Some(self.key.filter()),
            before,
            limit,
        }
    }

    /// Prefer the backend's cursor; fall back to the earliest confirmed
    /// item's timestamp. The fallback has no tie-break, so sources that
    /// never supply cursors need distinct timestamps within a stream.
    fn next_cursor(&self, page: &Page, items: &[StreamItem]) -> Option<Cursor> {
        page.next_cursor.clone().or_else(|| {
            items
                .iter()
                .find(|i| !i.pending)
                .map(|earliest| Cursor::from(earliest.sent_at.to_rfc3339()))
        })
    }

    fn still_live(&self, epoch: u64) -> bool {
        !self.is_disposed() && self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn fetch_error(&self, source: SourceError) -> EngineError {
        EngineError::Fetch {
            key: crate::keys::QueryKey::new(self.key.domain.clone(), self.key.session_id.clone()),
            source,
        }
    }

    fn snapshot_of(state: &StreamState) -> StreamSnapshot {
        StreamSnapshot {
            phase: state.phase,
            items: Arc::new(state.items.clone()),
            has_more: state.has_more,
        }
    }

    fn publish(&self, state: &StreamState) {
        let _ = self.snapshot_tx.send_replace(Self::snapshot_of(state));
    }
}

/// Decode rows, skipping any the backend shaped wrong.
fn decode_rows(rows: &[Value]) -> Vec<StreamItem> {
    rows.iter()
        .filter_map(|row| match StreamItem::from_row(row) {
            Ok(item) => Some(item),
            Err(error) => {
                warn!(error = %error, "dropping malformed row");
                None
            }
        })
        .collect()
}

/// Whether a page came back full, meaning older items may remain.
fn page_filled(page: &Page, limit: usize) -> bool {
    page.rows.len() == limit && page.has_more
}

/// Union-merge incoming items into the sequence. Items whose id is
/// already present are left untouched. Returns how many were added.
fn merge_items(items: &mut Vec<StreamItem>, incoming: Vec<StreamItem>) -> usize {
    let mut known: HashSet<ItemId> = items.iter().map(|i| i.id.clone()).collect();
    let mut added = 0;
    for item in incoming {
        if known.insert(item.id.clone()) {
            items.push(item);
            added += 1;
        }
    }
    if added > 0 {
        sort_items(items);
    }
    added
}

/// Order confirmed items by timestamp ascending (stable for equal
/// timestamps); pending items keep insertion order at the tail.
fn sort_items(items: &mut Vec<StreamItem>) {
    let mut confirmed = Vec::with_capacity(items.len());
    let mut tail = Vec::new();
    for item in items.drain(..) {
        if item.pending {
            tail.push(item);
        } else {
            confirmed.push(item);
        }
    }
    confirmed.sort_by_key(|i| i.sent_at);
    items.extend(confirmed);
    items.extend(tail);
}

/// Swap the temporary item for its confirmation, in place. If the
/// confirmed id was already merged by a poll, the temporary item is
/// removed instead so the id appears exactly once.
fn reconcile(items: &mut Vec<StreamItem>, temp_id: &ItemId, confirmed: StreamItem) {
    let already_present = items.iter().any(|i| i.id == confirmed.id);
    if already_present {
        items.retain(|i| i.id != *temp_id);
        return;
    }
    if let Some(slot) = items.iter_mut().find(|i| i.id == *temp_id) {
        *slot = confirmed;
    } else {
        // Temp item vanished (replaced stream); keep the confirmation
        // out rather than resurrecting it at a wrong position.
    }
}
