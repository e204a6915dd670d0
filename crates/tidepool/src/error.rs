//! Error types for the sync engine.

use thiserror::Error;

use crate::keys::QueryKey;

/// Errors produced by a backend data source or change-notification
/// transport.
///
/// Bindings wrap their concrete errors in [`SourceError::Transport`];
/// the engine only distinguishes "the transport broke" from "the backend
/// answered with an error".
#[derive(Debug, Error)]
pub enum SourceError {
    /// The transport failed (network, socket, timeout).
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The backend accepted the request and answered with an error.
    #[error("backend error {code}: {message}")]
    Backend { code: u16, message: String },

    /// A row could not be decoded into the expected shape.
    #[error("malformed row: {0}")]
    Row(#[from] serde_json::Error),

    /// The channel for a domain closed and will not reopen.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl SourceError {
    /// Wrap a concrete transport error.
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SourceError::Transport(Box::new(err))
    }
}

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A fetch through the data source failed.
    #[error("fetch failed for {key}: {source}")]
    Fetch {
        key: QueryKey,
        #[source]
        source: SourceError,
    },

    /// An optimistic send failed; the local item has been rolled back.
    #[error("send failed: {0}")]
    Send(#[source] SourceError),

    /// Operation on a stream or engine that has been shut down.
    #[error("engine is shut down")]
    ShutDown,

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
