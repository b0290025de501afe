//! Error types for the message-store client.

use thiserror::Error;

/// Errors surfaced by [`crate::MessageStore`] and its collaborators.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no stream covers subject pattern {subject_pattern:?}; create one named {suggested_name:?} or enable should_create_missing_streams")]
    StreamMissing {
        subject_pattern: String,
        suggested_name: String,
    },

    #[error("broker reported no stream response")]
    NoStreamResponse,

    #[error("broker service unavailable (503)")]
    ServiceUnavailable,

    #[error("operation timed out")]
    TransportTimeout,

    #[error("consumer not found")]
    ConsumerNotFound,

    #[error("wait_for timed out before a matching message arrived")]
    WaitForTimeout,

    #[error("not connected to broker")]
    NotConnected,

    #[error("broker error: {0}")]
    Broker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Retriability predicate for [`crate::MessageStore::publish`], grounded on
    /// `message_store.py`'s `publish_message` retry lambda: retriable iff the
    /// broker reported no stream response or a 503.
    pub fn is_publish_retriable(&self) -> bool {
        matches!(
            self,
            StoreError::NoStreamResponse | StoreError::ServiceUnavailable
        )
    }

    /// Retriability predicate for [`crate::MessageStore::fetch`], grounded on
    /// `message_store.py`'s `fetch` retry lambda: retriable on timeout, no
    /// stream response, 503, or "consumer not found" (404 + err_code 10014).
    pub fn is_fetch_retriable(&self) -> bool {
        matches!(
            self,
            StoreError::TransportTimeout
                | StoreError::NoStreamResponse
                | StoreError::ServiceUnavailable
                | StoreError::ConsumerNotFound
        )
    }
}
