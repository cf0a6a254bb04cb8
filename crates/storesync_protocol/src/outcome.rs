//! Per-record outcomes returned by a transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of exchanging one record with the remote node.
///
/// For a push batch this is the remote acknowledgment of a record we
/// sent; `remote_payload` is set when the remote holds a state different
/// from ours. For a pull batch every outcome is an incoming record and
/// carries the remote snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// Entity id the outcome refers to.
    pub entity_id: String,
    /// Whether the remote accepted the record.
    pub success: bool,
    /// Remote modification time of `remote_payload`.
    pub remote_timestamp: Option<DateTime<Utc>>,
    /// Remote snapshot.
    pub remote_payload: Option<Vec<u8>>,
    /// Remote base timestamp (last state of ours the remote had seen).
    #[serde(default)]
    pub remote_base_timestamp: Option<DateTime<Utc>>,
    /// Remote-side failure text.
    pub error: Option<String>,
    /// The remote snapshot is a tombstone.
    #[serde(default)]
    pub deleted: bool,
}

impl RecordOutcome {
    /// A plain acknowledgment.
    pub fn accepted(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            success: true,
            remote_timestamp: None,
            remote_payload: None,
            remote_base_timestamp: None,
            error: None,
            deleted: false,
        }
    }

    /// A rejection without a remote snapshot (retryable on our side).
    pub fn rejected(entity_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            success: false,
            remote_timestamp: None,
            remote_payload: None,
            remote_base_timestamp: None,
            error: Some(error.into()),
            deleted: false,
        }
    }

    /// A rejection because the remote holds a divergent snapshot.
    pub fn diverged(
        entity_id: impl Into<String>,
        remote_payload: Vec<u8>,
        remote_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            success: false,
            remote_timestamp: Some(remote_timestamp),
            remote_payload: Some(remote_payload),
            remote_base_timestamp: None,
            error: Some("remote state diverged".into()),
            deleted: false,
        }
    }

    /// An incoming remote record (pull).
    pub fn incoming(
        entity_id: impl Into<String>,
        remote_payload: Vec<u8>,
        remote_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            success: true,
            remote_timestamp: Some(remote_timestamp),
            remote_payload: Some(remote_payload),
            remote_base_timestamp: None,
            error: None,
            deleted: false,
        }
    }

    /// Marks the remote snapshot as a tombstone. The payload carries the
    /// last known state.
    pub fn as_tombstone(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Remote snapshot, `None` for tombstones.
    pub fn remote_state(&self) -> Option<&[u8]> {
        if self.deleted {
            None
        } else {
            self.remote_payload.as_deref()
        }
    }

    /// Sets the remote base timestamp.
    pub fn with_base_timestamp(mut self, base: Option<DateTime<Utc>>) -> Self {
        self.remote_base_timestamp = base;
        self
    }
}
