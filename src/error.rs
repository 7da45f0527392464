//! Errors surfaced by the remote store and the live caches.
//!
//! Nothing in this crate panics on a store failure: reads and mutations hand
//! back a `StoreError`, and a failed change feed only degrades a cache to its
//! last snapshot.

use thiserror::Error;
use warp::http::StatusCode;

const CONNECTIVITY_MESSAGE: &str = "Cannot connect to the transit database. The backing project may be paused or unreachable.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached at all (network failure, paused project).
    #[error("store unreachable: {0}")]
    Connectivity(String),

    /// The store answered but rejected the request.
    #[error("query rejected: {0}")]
    Query(String),

    /// The change feed could not be attached.
    #[error("subscription failed: {0}")]
    Subscription(String),

    /// A row came back in a shape the entity type cannot decode.
    #[error("malformed row from {table}: {reason}")]
    Decode { table: String, reason: String },

    /// `attach_stream` was called while a subscription is still open.
    #[error("a change feed is already attached to {0}")]
    AlreadyAttached(String),

    /// The cache was torn down and can no longer be used.
    #[error("cache for {0} has been torn down")]
    TornDown(String),
}

impl StoreError {
    pub fn decode(table: &str, err: impl std::fmt::Display) -> Self {
        StoreError::Decode {
            table: table.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_))
    }

    /// Text that is safe to put in front of an end user.
    pub fn user_message(&self) -> String {
        match self {
            StoreError::Connectivity(_) => CONNECTIVITY_MESSAGE.to_string(),
            StoreError::Query(m) => m.clone(),
            StoreError::Subscription(_) => "Live updates are currently unavailable".to_string(),
            StoreError::Decode { .. } => "The server returned data in an unexpected format".to_string(),
            StoreError::AlreadyAttached(_) | StoreError::TornDown(_) => {
                "The live data service is not available".to_string()
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            StoreError::Connectivity(_) | StoreError::Subscription(_) | StoreError::TornDown(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StoreError::Query(m) if m.contains("not found") => StatusCode::NOT_FOUND,
            StoreError::Query(_) => StatusCode::BAD_REQUEST,
            StoreError::Decode { .. } => StatusCode::BAD_GATEWAY,
            StoreError::AlreadyAttached(_) => StatusCode::CONFLICT,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            StoreError::Connectivity(e.to_string())
        } else if e.is_decode() {
            StoreError::Query(format!("unreadable response: {}", e))
        } else {
            StoreError::Query(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_message_is_distinct() {
        let err = StoreError::Connectivity("dns error".into());
        assert!(err.is_connectivity());
        assert_eq!(err.user_message(), CONNECTIVITY_MESSAGE);
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err = StoreError::Query("duplicate key value".into());
        assert!(!err.is_connectivity());
        assert_eq!(err.user_message(), "duplicate key value");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let err = StoreError::Query("row not found".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
