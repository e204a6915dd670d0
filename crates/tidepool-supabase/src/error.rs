//! Error types for the Supabase binding.

use thiserror::Error;
use tidepool::SourceError;

/// Errors that can occur when talking to Supabase.
#[derive(Debug, Error)]
pub enum SupabaseError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// PostgREST answered with an error payload.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// A filter could not be turned into query predicates.
    #[error("invalid filter: {0}")]
    Filter(String),

    /// Response deviated from the PostgREST wire contract.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl SupabaseError {
    /// Check if an error is transient and worth retrying.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            SupabaseError::Http(_) => true,
            SupabaseError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<SupabaseError> for SourceError {
    fn from(err: SupabaseError) -> Self {
        match err {
            SupabaseError::Api { status, message } => SourceError::Backend {
                code: status,
                message,
            },
            SupabaseError::Json(e) => SourceError::Row(e),
            other => SourceError::transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transient() {
        assert!(
            SupabaseError::Api {
                status: 503,
                message: "unavailable".to_string()
            }
            .is_transient()
        );
        assert!(
            SupabaseError::Api {
                status: 429,
                message: "slow down".to_string()
            }
            .is_transient()
        );
        assert!(
            !SupabaseError::Api {
                status: 400,
                message: "bad filter".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_api_error_maps_to_backend() {
        let err = SupabaseError::Api {
            status: 409,
            message: "conflict".to_string(),
        };
        assert!(matches!(
            SourceError::from(err),
            SourceError::Backend { code: 409, .. }
        ));
    }
}
