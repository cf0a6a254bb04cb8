//! Error types for storage operations.

use storesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The row changed since the caller read it.
    #[error("version conflict on {kind} {id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Kind of row.
        kind: &'static str,
        /// Row id.
        id: String,
        /// Version the caller expected.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The row does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of row.
        kind: &'static str,
        /// Row id.
        id: String,
    },

    /// A row with the same identity already exists.
    #[error("duplicate {kind}: {id}")]
    Duplicate {
        /// Kind of row.
        kind: &'static str,
        /// Row id.
        id: String,
    },

    /// A row failed a data model check on write.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl StorageError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn duplicate(kind: &'static str, id: impl ToString) -> Self {
        Self::Duplicate {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn version_conflict(kind: &'static str, id: impl ToString, expected: u64, actual: u64) -> Self {
        Self::VersionConflict {
            kind,
            id: id.to_string(),
            expected,
            actual,
        }
    }

    /// Returns true for optimistic concurrency failures.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StorageError::VersionConflict { .. })
    }
}
