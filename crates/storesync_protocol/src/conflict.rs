//! Conflict records, policies and resolutions.

use crate::batch::BatchDirection;
use crate::ids::{EntityKey, EntityType, StoreId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Returns the SHA-256 digest of a serialized snapshot.
pub fn snapshot_digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Policy for settling a conflict automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Local state always wins.
    LocalWins,
    /// Remote state always wins.
    RemoteWins,
    /// Newer timestamp wins; ties go to local.
    LatestTimestampWins,
    /// Leave unresolved for an operator.
    ManualReview,
}

impl ConflictPolicy {
    /// Returns true if this policy settles conflicts without an operator.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::ManualReview)
    }

    /// Picks the winning side, or `None` when a human must decide.
    ///
    /// Ties under `LatestTimestampWins` go to local so that two nodes
    /// resolving the same pair never hand the record back and forth.
    pub fn decide(
        &self,
        local_timestamp: DateTime<Utc>,
        remote_timestamp: DateTime<Utc>,
    ) -> Option<ConflictResolution> {
        match self {
            ConflictPolicy::LocalWins => Some(ConflictResolution::LocalWins),
            ConflictPolicy::RemoteWins => Some(ConflictResolution::RemoteWins),
            ConflictPolicy::LatestTimestampWins => {
                if remote_timestamp > local_timestamp {
                    Some(ConflictResolution::RemoteWins)
                } else {
                    Some(ConflictResolution::LocalWins)
                }
            }
            ConflictPolicy::ManualReview => None,
        }
    }
}

/// Outcome chosen for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Local state was kept.
    LocalWins,
    /// Remote state was applied.
    RemoteWins,
    /// An operator supplied a merged payload.
    Merged,
}

/// Resolution status of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Awaiting a decision.
    Unresolved,
    /// Settled.
    Resolved,
}

/// A detected divergence between local and remote state of one entity.
///
/// Conflicts are never deleted; they form the audit trail of every
/// divergence and how it was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict id.
    pub id: Uuid,
    /// Store that detected the conflict.
    pub store_id: StoreId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: String,
    /// Direction of the batch that surfaced the conflict.
    pub direction: BatchDirection,
    /// Batch that surfaced the conflict.
    pub batch_id: Option<Uuid>,
    /// Queue item held in `conflicted` while this is unresolved.
    pub queue_item_id: Option<Uuid>,
    /// Local snapshot (`None` if deleted locally).
    pub local_data: Option<Vec<u8>>,
    /// Local modification time.
    pub local_timestamp: DateTime<Utc>,
    /// Remote snapshot (`None` if deleted remotely).
    pub remote_data: Option<Vec<u8>>,
    /// Remote modification time.
    pub remote_timestamp: DateTime<Utc>,
    /// Digest of the local snapshot.
    pub local_digest: Option<[u8; 32]>,
    /// Digest of the remote snapshot.
    pub remote_digest: Option<[u8; 32]>,
    /// Resolution status.
    pub status: ConflictStatus,
    /// Chosen outcome.
    pub resolution: Option<ConflictResolution>,
    /// Operator who resolved the conflict (manual resolutions only).
    pub resolved_by: Option<String>,
    /// When the conflict was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Free-text notes. Automatic resolutions name their policy here.
    pub notes: Option<String>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
    /// Row version for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

impl SyncConflict {
    /// Creates an unresolved conflict.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store_id: StoreId,
        key: EntityKey,
        direction: BatchDirection,
        local_data: Option<Vec<u8>>,
        local_timestamp: DateTime<Utc>,
        remote_data: Option<Vec<u8>>,
        remote_timestamp: DateTime<Utc>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let local_digest = local_data.as_deref().map(snapshot_digest);
        let remote_digest = remote_data.as_deref().map(snapshot_digest);
        Self {
            id: Uuid::new_v4(),
            store_id,
            entity_type: key.entity_type,
            entity_id: key.entity_id,
            direction,
            batch_id: None,
            queue_item_id: None,
            local_data,
            local_timestamp,
            remote_data,
            remote_timestamp,
            local_digest,
            remote_digest,
            status: ConflictStatus::Unresolved,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            notes: None,
            detected_at,
            version: 0,
        }
    }

    /// Links the conflict to its batch and queue item.
    pub fn with_origin(mut self, batch_id: Option<Uuid>, queue_item_id: Option<Uuid>) -> Self {
        self.batch_id = batch_id;
        self.queue_item_id = queue_item_id;
        self
    }

    /// Returns the entity identity.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Returns true once resolved.
    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }

    /// Marks the conflict resolved.
    ///
    /// Resolving an already resolved conflict changes nothing and returns
    /// the outcome chosen the first time.
    pub fn resolve(
        &mut self,
        resolution: ConflictResolution,
        resolved_by: Option<String>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> ConflictResolution {
        if let (ConflictStatus::Resolved, Some(prior)) = (self.status, self.resolution) {
            return prior;
        }
        self.status = ConflictStatus::Resolved;
        self.resolution = Some(resolution);
        self.resolved_by = resolved_by;
        self.resolved_at = Some(now);
        if notes.is_some() {
            self.notes = notes;
        }
        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn conflict() -> SyncConflict {
        SyncConflict::new(
            StoreId::new(),
            EntityKey::new("price", "sku-1"),
            BatchDirection::Pull,
            Some(b"local".to_vec()),
            ts(100),
            Some(b"remote".to_vec()),
            ts(90),
            ts(120),
        )
    }

    #[test]
    fn latest_timestamp_wins() {
        let policy = ConflictPolicy::LatestTimestampWins;
        assert_eq!(policy.decide(ts(100), ts(90)), Some(ConflictResolution::LocalWins));
        assert_eq!(policy.decide(ts(90), ts(100)), Some(ConflictResolution::RemoteWins));
    }

    #[test]
    fn ties_break_toward_local() {
        let policy = ConflictPolicy::LatestTimestampWins;
        assert_eq!(policy.decide(ts(50), ts(50)), Some(ConflictResolution::LocalWins));
    }

    #[test]
    fn fixed_policies_ignore_timestamps() {
        assert_eq!(
            ConflictPolicy::LocalWins.decide(ts(1), ts(2)),
            Some(ConflictResolution::LocalWins)
        );
        assert_eq!(
            ConflictPolicy::RemoteWins.decide(ts(2), ts(1)),
            Some(ConflictResolution::RemoteWins)
        );
        assert_eq!(ConflictPolicy::ManualReview.decide(ts(1), ts(2)), None);
        assert!(!ConflictPolicy::ManualReview.auto_resolves());
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut conflict = conflict();
        let first = conflict.resolve(
            ConflictResolution::RemoteWins,
            Some("manager".into()),
            Some("price list wins".into()),
            ts(130),
        );
        assert_eq!(first, ConflictResolution::RemoteWins);

        let second = conflict.resolve(ConflictResolution::LocalWins, None, None, ts(140));
        assert_eq!(second, ConflictResolution::RemoteWins);
        assert_eq!(conflict.resolved_at, Some(ts(130)));
        assert_eq!(conflict.resolved_by.as_deref(), Some("manager"));
        assert_eq!(conflict.notes.as_deref(), Some("price list wins"));
    }

    #[test]
    fn digests_follow_snapshots() {
        let conflict = conflict();
        assert_eq!(conflict.local_digest, Some(snapshot_digest(b"local")));
        assert_eq!(conflict.remote_digest, Some(snapshot_digest(b"remote")));
        assert_ne!(conflict.local_digest, conflict.remote_digest);
    }
}
