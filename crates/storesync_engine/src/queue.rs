//! Outbound sync queue.

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::registry::EntityRegistry;
use std::sync::Arc;
use storesync_protocol::{
    BatchDirection, EntityKey, EntityType, OperationType, QueueItemStatus, StoreId, SyncQueueItem,
};
use storesync_storage::{QueueClaim, QueueFilter, SyncStore};
use tracing::{debug, warn};
use uuid::Uuid;

/// Priority-ordered queue of local changes awaiting transmission.
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<dyn SyncStore>,
    registry: Arc<EntityRegistry>,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    /// Creates a queue over `store`.
    pub fn new(store: Arc<dyn SyncStore>, registry: Arc<EntityRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    /// Enqueues a pending push of `payload` stamped at the current time.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty id, an unregistered entity type or a
    ///   payload the type's adapter cannot decode
    /// - `Configuration` when the store has no enabled rule that pushes
    ///   this entity type
    pub fn enqueue(
        &self,
        store_id: StoreId,
        key: EntityKey,
        operation: OperationType,
        payload: Vec<u8>,
        priority: i32,
    ) -> SyncResult<SyncQueueItem> {
        let item = SyncQueueItem::new(store_id, key, operation, payload, self.clock.now())
            .with_priority(priority);
        self.submit(item)
    }

    /// Validates and inserts a prepared item.
    ///
    /// The item is forced to a fresh `pending` push, its payload is
    /// canonicalized and its attempt ceiling is taken from the store's
    /// configuration. Errors are the same as [`enqueue`](Self::enqueue).
    pub fn submit(&self, mut item: SyncQueueItem) -> SyncResult<SyncQueueItem> {
        self.validate(&mut item)?;
        let inserted = self.store.insert_queue_item(item)?;
        debug!(
            store_id = %inserted.store_id,
            entity_type = %inserted.entity_type,
            item_id = %inserted.id,
            priority = inserted.priority,
            "Enqueued change"
        );
        Ok(inserted)
    }

    /// Checks an item against the registry and the store's rules and
    /// normalizes it for insertion without inserting it.
    pub fn validate(&self, item: &mut SyncQueueItem) -> SyncResult<()> {
        let checked = self.check(item);
        if let Err(err) = &checked {
            warn!(
                store_id = %item.store_id,
                entity_type = %item.entity_type,
                entity_id = %item.entity_id,
                error = %err,
                "Rejected enqueue"
            );
        }
        checked
    }

    fn check(&self, item: &mut SyncQueueItem) -> SyncResult<()> {
        if item.entity_id.trim().is_empty() {
            return Err(SyncError::Validation("entity id is empty".into()));
        }
        let adapter = self.registry.adapter(&item.entity_type)?;
        if !(item.operation.is_delete() && item.payload.is_empty()) {
            item.payload = adapter.canonicalize(&item.payload).map_err(|e| {
                SyncError::Validation(format!(
                    "payload for {}/{} does not decode: {e}",
                    item.entity_type, item.entity_id
                ))
            })?;
        }

        let config = self.store.configuration(item.store_id)?.ok_or_else(|| {
            SyncError::Configuration(format!("store {} has no sync configuration", item.store_id))
        })?;
        let pushes = self
            .store
            .rule(item.store_id, &item.entity_type)?
            .is_some_and(|r| r.enabled && r.direction.allows(BatchDirection::Push));
        if !pushes {
            return Err(SyncError::Configuration(format!(
                "no enabled push rule for {} in store {}",
                item.entity_type, item.store_id
            )));
        }

        item.direction = BatchDirection::Push;
        item.status = QueueItemStatus::Pending;
        item.attempts = 0;
        item.next_retry_at = None;
        item.batch_id = None;
        item.max_attempts = config.retry_attempts;
        Ok(())
    }

    /// Atomically claims up to `max_items` eligible pending items of one
    /// partition for `batch_id`, highest priority then oldest first.
    pub fn dequeue_batch(
        &self,
        store_id: StoreId,
        direction: BatchDirection,
        entity_type: &EntityType,
        max_items: usize,
        batch_id: Uuid,
    ) -> SyncResult<Vec<SyncQueueItem>> {
        let claim = QueueClaim {
            store_id,
            direction,
            entity_type: entity_type.clone(),
            max_items,
            batch_id,
            now: self.clock.now(),
        };
        Ok(self.store.claim_pending(&claim)?)
    }

    /// Returns true if an unsynced change for `key` is queued, ignoring
    /// the item `except`.
    pub fn has_open_change(
        &self,
        store_id: StoreId,
        key: &EntityKey,
        except: Option<Uuid>,
    ) -> SyncResult<bool> {
        let filter = QueueFilter::store(store_id).entity(key).statuses(&[
            QueueItemStatus::Pending,
            QueueItemStatus::Processing,
            QueueItemStatus::Conflicted,
        ]);
        Ok(self
            .store
            .queue_items(&filter)?
            .iter()
            .any(|item| Some(item.id) != except))
    }
}
