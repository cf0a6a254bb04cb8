//! Append-only sync log entries.

use crate::ids::{EntityType, StoreId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// What a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// A batch was handed to the transport.
    BatchStarted,
    /// A batch finished (any final status).
    BatchCompleted,
    /// A cancelled batch returned its records to the queue.
    BatchCancelled,
    /// A queue item failed and was scheduled for retry.
    QueueItemRetried,
    /// A queue item reached its attempt ceiling.
    QueueItemFailed,
    /// A conflict was detected.
    ConflictRaised,
    /// A conflict was resolved.
    ConflictResolved,
    /// A cycle was skipped (disabled store or contended key).
    CycleSkipped,
    /// A store's sync was paused by an operator.
    SyncPaused,
    /// A store's sync was resumed by an operator.
    SyncResumed,
}

/// One write-once audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Entry id.
    pub id: Uuid,
    /// Store the entry belongs to.
    pub store_id: StoreId,
    /// Event kind.
    pub event: LogEvent,
    /// Entity type, when the event concerns one.
    pub entity_type: Option<EntityType>,
    /// Related batch.
    pub batch_id: Option<Uuid>,
    /// Related queue item.
    pub queue_item_id: Option<Uuid>,
    /// Related conflict.
    pub conflict_id: Option<Uuid>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Whether the host application should alert on this entry.
    pub alert: bool,
    /// Duration of the operation in milliseconds.
    pub duration_ms: u64,
    /// Human-readable detail.
    pub message: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl SyncLogEntry {
    /// Creates a successful, non-alerting entry.
    pub fn new(
        store_id: StoreId,
        event: LogEvent,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            store_id,
            event,
            entity_type: None,
            batch_id: None,
            queue_item_id: None,
            conflict_id: None,
            success: true,
            alert: false,
            duration_ms: 0,
            message: message.into(),
            created_at,
        }
    }

    /// Sets the entity type.
    pub fn with_entity_type(mut self, entity_type: &EntityType) -> Self {
        self.entity_type = Some(entity_type.clone());
        self
    }

    /// Sets the related batch.
    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// Sets the related queue item.
    pub fn with_queue_item(mut self, item_id: Uuid) -> Self {
        self.queue_item_id = Some(item_id);
        self
    }

    /// Sets the related conflict.
    pub fn with_conflict(mut self, conflict_id: Uuid) -> Self {
        self.conflict_id = Some(conflict_id);
        self
    }

    /// Sets the success flag.
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Marks the entry as alertable (implies failure).
    pub fn alerting(mut self) -> Self {
        self.alert = true;
        self.success = false;
        self
    }

    /// Sets the duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
