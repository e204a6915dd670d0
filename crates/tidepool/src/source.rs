//! Ports to the backend: paginated reads, mutations, and the
//! change-notification transport.
//!
//! The engine never talks to a backend directly. Bindings implement
//! these traits; the engine stays testable against in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SourceError;
use crate::keys::{Cursor, Domain, QueryKey};

/// Kind of change observed on a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Structural changes (row added or removed) fan out to linked
    /// domains; field updates do not.
    pub fn is_structural(&self) -> bool {
        matches!(self, ChangeKind::Insert | ChangeKind::Delete)
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single change event delivered over a domain's channel.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub domain: Domain,
    pub kind: ChangeKind,
    /// Row id when the transport exposes one. Used for tracing only;
    /// invalidation is domain-granular.
    pub row_id: Option<String>,
}

/// A page request against one domain.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub domain: Domain,
    /// Backend-interpreted filter. `None` means the domain's root query.
    pub filter: Option<Value>,
    /// Fetch rows older than this cursor. `None` means the most recent
    /// page.
    pub before: Option<Cursor>,
    pub limit: usize,
}

impl PageRequest {
    /// Most-recent-page request for a domain's root query.
    pub fn latest(domain: impl Into<Domain>, limit: usize) -> Self {
        Self {
            domain: domain.into(),
            filter: None,
            before: None,
            limit,
        }
    }

    /// Reconstruct the request that produced a cache key.
    ///
    /// Key signatures are the serialized filter, so the filter is
    /// recoverable from the key alone.
    pub fn for_key(key: &QueryKey, limit: usize) -> Result<Self, serde_json::Error> {
        let filter = if key.signature.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&key.signature)?)
        };
        Ok(Self {
            domain: key.domain.clone(),
            filter,
            before: None,
            limit,
        })
    }
}

/// One page of rows, ordered by creation time ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub rows: Vec<Value>,
    /// Cursor for the page older than this one, if the backend knows it.
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

/// A write against one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Insert { row: Value },
    Update { id: String, patch: Value },
    Delete { id: String },
}

/// Paginated read and write access to the backend.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch one page of rows.
    async fn fetch_page(&self, req: &PageRequest) -> Result<Page, SourceError>;

    /// Apply a mutation and return the confirmed row.
    async fn mutate(&self, domain: &Domain, mutation: Mutation) -> Result<Value, SourceError>;
}

/// Opens change-notification channels, one per domain.
///
/// The returned receiver yields events until the channel fails
/// permanently, at which point it closes. Dropping the receiver is the
/// unsubscribe: the transport observes the closed channel and tears down
/// its end. Transports may drop events under backpressure; a lost event
/// only delays a refresh until the polling backstop.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, domain: &Domain) -> Result<mpsc::Receiver<ChangeEvent>, SourceError>;
}
