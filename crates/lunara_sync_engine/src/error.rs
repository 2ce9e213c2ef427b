//! Error types for the sync engine.
//!
//! Conflicts are deliberately absent here: a conflict is a first-class
//! outcome (`lunara_sync_model::Resolution::Manual`), not a failure.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Network or transport error.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Authentication failed; the user must re-authenticate.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote store rejected a record's payload.
    #[error("payload rejected for entity {entity_id}: {reason}")]
    Validation {
        /// The rejected entity.
        entity_id: String,
        /// Rejection reason reported by the remote store.
        reason: String,
    },

    /// Remote storage quota exceeded; terminal for the cycle.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Local store error.
    #[error("local store error: {0}")]
    Storage(String),

    /// Programming error, e.g. a cursor regression.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The cycle was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable network error (timeout, 5xx, rate limit).
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error (4xx, malformed request).
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a local store error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true if the operation may be retried within the cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
