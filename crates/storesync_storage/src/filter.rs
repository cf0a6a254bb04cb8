//! Query and claim parameters.

use chrono::{DateTime, Utc};
use storesync_protocol::{
    BatchDirection, ConflictStatus, EntityKey, EntityType, QueueItemStatus, StoreId, SyncConflict,
    SyncQueueItem,
};
use uuid::Uuid;

/// An exclusive dequeue request for one queue partition.
#[derive(Debug, Clone)]
pub struct QueueClaim {
    /// Store whose queue is drained.
    pub store_id: StoreId,
    /// Queue partition direction.
    pub direction: BatchDirection,
    /// Queue partition entity type.
    pub entity_type: EntityType,
    /// Upper bound on claimed items.
    pub max_items: usize,
    /// Batch the claimed items are assigned to.
    pub batch_id: Uuid,
    /// Items with a later `next_retry_at` are skipped.
    pub now: DateTime<Utc>,
}

impl QueueClaim {
    /// Returns true if `item` belongs to this claim's partition and is eligible now.
    pub fn selects(&self, item: &SyncQueueItem) -> bool {
        item.store_id == self.store_id
            && item.direction == self.direction
            && item.entity_type == self.entity_type
            && item.is_eligible(self.now)
    }
}

/// Filter for listing queue items. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    /// Store.
    pub store_id: Option<StoreId>,
    /// Entity type.
    pub entity_type: Option<EntityType>,
    /// Entity id (requires `entity_type` to be meaningful).
    pub entity_id: Option<String>,
    /// Accepted statuses.
    pub statuses: Vec<QueueItemStatus>,
}

impl QueueFilter {
    /// Matches every item of a store.
    pub fn store(store_id: StoreId) -> Self {
        Self {
            store_id: Some(store_id),
            ..Self::default()
        }
    }

    /// Restricts to one entity.
    pub fn entity(mut self, key: &EntityKey) -> Self {
        self.entity_type = Some(key.entity_type.clone());
        self.entity_id = Some(key.entity_id.clone());
        self
    }

    /// Restricts to the given statuses.
    pub fn statuses(mut self, statuses: &[QueueItemStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    /// Returns true if `item` passes the filter.
    pub fn matches(&self, item: &SyncQueueItem) -> bool {
        self.store_id.map_or(true, |s| s == item.store_id)
            && self
                .entity_type
                .as_ref()
                .map_or(true, |t| *t == item.entity_type)
            && self
                .entity_id
                .as_ref()
                .map_or(true, |id| *id == item.entity_id)
            && (self.statuses.is_empty() || self.statuses.contains(&item.status))
    }
}

/// Filter for listing conflicts. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ConflictFilter {
    /// Store.
    pub store_id: Option<StoreId>,
    /// Resolution status.
    pub status: Option<ConflictStatus>,
    /// Entity.
    pub entity: Option<EntityKey>,
}

impl ConflictFilter {
    /// Unresolved conflicts of a store.
    pub fn unresolved(store_id: StoreId) -> Self {
        Self {
            store_id: Some(store_id),
            status: Some(ConflictStatus::Unresolved),
            entity: None,
        }
    }

    /// Returns true if `conflict` passes the filter.
    pub fn matches(&self, conflict: &SyncConflict) -> bool {
        self.store_id.map_or(true, |s| s == conflict.store_id)
            && self.status.map_or(true, |s| s == conflict.status)
            && self.entity.as_ref().map_or(true, |key| {
                key.entity_type == conflict.entity_type && key.entity_id == conflict.entity_id
            })
    }
}
