//! Error types for the sync engine.

use std::time::Duration;
use storesync_protocol::ProtocolError;
use storesync_storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The request is malformed and will never succeed as submitted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The transport exchange overran its timeout.
    #[error("transport exchange timed out after {0:?}")]
    Timeout(Duration),

    /// No enabled rule or configuration covers the request.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A queue item reached its attempt ceiling.
    #[error("queue item {item_id} failed after {attempts} attempts: {last_error}")]
    TerminalFailure {
        /// Queue item.
        item_id: Uuid,
        /// Attempts consumed.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// Storage collaborator error.
    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    /// Data model or codec error.
    #[error("protocol error: {0}")]
    Protocol(#[source] ProtocolError),

    /// Invalid state transition.
    #[error("invalid state transition for {entity} from {from} to {to}")]
    InvalidStateTransition {
        /// Kind of row.
        entity: &'static str,
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A referenced row does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of row.
        kind: &'static str,
        /// Row id.
        id: String,
    },

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A persisted row broke a data model invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout(_) => true,
            SyncError::Storage(e) => e.is_version_conflict(),
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidTransition { entity, from, to } => {
                SyncError::InvalidStateTransition { entity, from, to }
            }
            ProtocolError::Invariant(message) => SyncError::InvariantViolation(message),
            other => SyncError::Protocol(other),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Protocol(inner) => inner.into(),
            StorageError::NotFound { kind, id } => SyncError::NotFound { kind, id },
            other => SyncError::Storage(other),
        }
    }
}
