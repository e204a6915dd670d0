//! Core key types: domains, query keys, and pagination cursors.

use serde::{Deserialize, Serialize};

/// Contact/kanban records.
pub const CONTACTS_DOMAIN: &str = "contacts";
/// Chat conversations and their message streams.
pub const CONVERSATIONS_DOMAIN: &str = "conversations";
/// Scheduled appointments.
pub const APPOINTMENTS_DOMAIN: &str = "appointments";
/// Per-client aggregate counters shown in list headers.
pub const CLIENT_STATS_DOMAIN: &str = "client-stats";
/// Dashboard aggregate metrics (funnel, UTM, totals).
pub const DASHBOARD_METRICS_DOMAIN: &str = "dashboard-metrics";
/// Conversation volume/latency aggregates.
pub const CONVERSATION_METRICS_DOMAIN: &str = "conversation-metrics";

/// A named category of server data treated as a unit of invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(pub String);

impl Domain {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A cache key: a domain plus the signature of the filter that produced
/// the result.
///
/// Two queries over the same domain with different filters are distinct
/// entries; invalidating the domain touches both. The signature for the
/// unfiltered root query is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub domain: Domain,
    pub signature: String,
}

impl QueryKey {
    /// Key for the unfiltered root query of a domain.
    pub fn root(domain: impl Into<Domain>) -> Self {
        Self {
            domain: domain.into(),
            signature: String::new(),
        }
    }

    /// Key for a query with an explicit signature.
    pub fn new(domain: impl Into<Domain>, signature: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            signature: signature.into(),
        }
    }

    /// Key for a query whose signature is the serialized filter.
    ///
    /// Filters serialize deterministically for a given struct, so equal
    /// filters always map to the same entry.
    pub fn with_filter<F: Serialize>(
        domain: impl Into<Domain>,
        filter: &F,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            domain: domain.into(),
            signature: serde_json::to_string(filter)?,
        })
    }

    /// Whether this key belongs to the given domain.
    pub fn in_domain(&self, domain: &Domain) -> bool {
        self.domain == *domain
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.signature.is_empty() {
            write!(f, "{}", self.domain)
        } else {
            write!(f, "{}?{}", self.domain, self.signature)
        }
    }
}

/// Opaque pagination token handed back by the backend.
///
/// The engine never inspects it; it only threads it into the next
/// `fetch_page` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Cursor {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
