//! Outbound queue items and their status state machine.

use crate::batch::BatchDirection;
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{EntityKey, EntityType, StoreId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of local mutation carried by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Entity was created.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted. The payload is the last known snapshot.
    Delete,
}

impl OperationType {
    /// Returns true for deletes.
    pub fn is_delete(&self) -> bool {
        matches!(self, OperationType::Delete)
    }
}

/// Status of a queue item.
///
/// ```text
/// pending -> processing -> completed
///                       -> pending     (retryable failure, cancellation)
///                       -> failed      (attempt ceiling reached)
///                       -> conflicted -> completed (after resolution)
/// failed -> pending                    (only backward edge)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Waiting to be batched.
    Pending,
    /// Claimed by a batch and in flight.
    Processing,
    /// Applied and acknowledged by the remote side.
    Completed,
    /// Attempt ceiling reached; left for operator inspection.
    Failed,
    /// Waiting on conflict resolution.
    Conflicted,
}

impl QueueItemStatus {
    /// Returns true if moving to `next` is allowed.
    pub fn can_transition_to(&self, next: QueueItemStatus) -> bool {
        use QueueItemStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
                | (Processing, Conflicted)
                | (Conflicted, Completed)
                | (Failed, Pending)
        )
    }

    /// Returns true for statuses no worker will pick up again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueItemStatus::Completed | QueueItemStatus::Failed)
    }

    /// Returns true while the item still represents an unsynced local change.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::Pending | QueueItemStatus::Processing | QueueItemStatus::Conflicted
        )
    }
}

/// One pending create/update/delete awaiting transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Item id.
    pub id: Uuid,
    /// Store whose queue holds the item.
    pub store_id: StoreId,
    /// Direction of the queue partition.
    pub direction: BatchDirection,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: String,
    /// Mutation kind.
    pub operation: OperationType,
    /// Serialized entity snapshot.
    pub payload: Vec<u8>,
    /// Higher priorities are dequeued first.
    pub priority: i32,
    /// Current status.
    pub status: QueueItemStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Error from the last failed attempt.
    pub last_error: Option<String>,
    /// Earliest time the item may be dequeued again.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Batch the item was last assigned to.
    pub batch_id: Option<Uuid>,
    /// When the item was enqueued.
    pub queued_at: DateTime<Utc>,
    /// Local modification time of the snapshot.
    pub entity_timestamp: DateTime<Utc>,
    /// Last remote state this node had seen for the entity.
    pub base_timestamp: Option<DateTime<Utc>>,
    /// Row version for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

impl SyncQueueItem {
    /// Creates a pending push item enqueued at `now`.
    pub fn new(
        store_id: StoreId,
        key: EntityKey,
        operation: OperationType,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            store_id,
            direction: BatchDirection::Push,
            entity_type: key.entity_type,
            entity_id: key.entity_id,
            operation,
            payload,
            priority: 0,
            status: QueueItemStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            next_retry_at: None,
            batch_id: None,
            queued_at: now,
            entity_timestamp: now,
            base_timestamp: None,
            version: 0,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the snapshot's local modification time.
    pub fn with_entity_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.entity_timestamp = timestamp;
        self
    }

    /// Sets the base timestamp.
    pub fn with_base_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.base_timestamp = timestamp;
        self
    }

    /// Returns the entity identity.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Moves the item to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: QueueItemStatus) -> ProtocolResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ProtocolError::transition("queue item", self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// Returns true if the item may be dequeued at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueItemStatus::Pending
            && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Returns true if another attempt is allowed after the current failure count.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item() -> SyncQueueItem {
        SyncQueueItem::new(
            StoreId::new(),
            EntityKey::new("product", "p-1"),
            OperationType::Update,
            b"{}".to_vec(),
            Utc::now(),
        )
    }

    #[test]
    fn forward_transitions() {
        let mut item = item();
        item.transition(QueueItemStatus::Processing).unwrap();
        item.transition(QueueItemStatus::Conflicted).unwrap();
        item.transition(QueueItemStatus::Completed).unwrap();
        assert!(item.status.is_terminal());
    }

    #[test]
    fn completed_never_moves_back() {
        let mut item = item();
        item.transition(QueueItemStatus::Processing).unwrap();
        item.transition(QueueItemStatus::Completed).unwrap();

        let err = item.transition(QueueItemStatus::Pending).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTransition { .. }));
        assert_eq!(item.status, QueueItemStatus::Completed);
    }

    #[test]
    fn failed_to_pending_is_the_only_backward_edge() {
        assert!(QueueItemStatus::Failed.can_transition_to(QueueItemStatus::Pending));
        assert!(!QueueItemStatus::Conflicted.can_transition_to(QueueItemStatus::Pending));
        assert!(!QueueItemStatus::Pending.can_transition_to(QueueItemStatus::Completed));
    }

    #[test]
    fn eligibility_respects_next_retry() {
        let now = Utc::now();
        let mut item = item();
        assert!(item.is_eligible(now));

        item.next_retry_at = Some(now + Duration::seconds(5));
        assert!(!item.is_eligible(now));
        assert!(item.is_eligible(now + Duration::seconds(5)));

        item.status = QueueItemStatus::Processing;
        assert!(!item.is_eligible(now + Duration::seconds(10)));
    }

    #[test]
    fn open_statuses() {
        assert!(QueueItemStatus::Pending.is_open());
        assert!(QueueItemStatus::Conflicted.is_open());
        assert!(!QueueItemStatus::Completed.is_open());
        assert!(!QueueItemStatus::Failed.is_open());
    }
}
