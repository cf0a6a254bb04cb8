//! Storage collaborator trait for sync bookkeeping.

use crate::error::StorageResult;
use crate::filter::{ConflictFilter, QueueClaim, QueueFilter};
use storesync_protocol::{
    EntityType, StoreId, SyncBatch, SyncConfiguration, SyncConflict, SyncEntityRule, SyncLogEntry,
    SyncQueueItem,
};
use uuid::Uuid;

/// Transactional storage for every row the sync engine owns.
///
/// # Invariants
///
/// - `insert_*` stores the row with `version = 1` and returns it
/// - `update_*` succeeds only if the stored version equals
///   `expected_version`; the stored row then gets `expected_version + 1`
/// - At most one rule exists per (store, entity type)
/// - `claim_pending` is atomic: an item is returned by at most one claim
///   until it is moved back to `pending`
/// - Log entries are append-only
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - reference backend for tests and tools
pub trait SyncStore: Send + Sync {
    /// Inserts a store's configuration.
    ///
    /// # Errors
    ///
    /// Fails with `Duplicate` if the store already has one.
    fn insert_configuration(&self, config: SyncConfiguration) -> StorageResult<SyncConfiguration>;

    /// Reads a store's configuration.
    fn configuration(&self, store_id: StoreId) -> StorageResult<Option<SyncConfiguration>>;

    /// Lists all configurations.
    fn configurations(&self) -> StorageResult<Vec<SyncConfiguration>>;

    /// Replaces a configuration.
    fn update_configuration(
        &self,
        config: SyncConfiguration,
        expected_version: u64,
    ) -> StorageResult<SyncConfiguration>;

    /// Inserts an entity rule.
    ///
    /// # Errors
    ///
    /// Fails with `Duplicate` if the (store, entity type) pair already has
    /// a rule, and with `NotFound` if the store has no configuration.
    fn insert_rule(&self, rule: SyncEntityRule) -> StorageResult<SyncEntityRule>;

    /// Replaces an entity rule.
    fn update_rule(&self, rule: SyncEntityRule, expected_version: u64) -> StorageResult<SyncEntityRule>;

    /// Reads the rule for one entity type.
    fn rule(&self, store_id: StoreId, entity_type: &EntityType) -> StorageResult<Option<SyncEntityRule>>;

    /// Lists a store's rules.
    fn rules(&self, store_id: StoreId) -> StorageResult<Vec<SyncEntityRule>>;

    /// Inserts a queue item.
    fn insert_queue_item(&self, item: SyncQueueItem) -> StorageResult<SyncQueueItem>;

    /// Reads a queue item.
    fn queue_item(&self, id: Uuid) -> StorageResult<Option<SyncQueueItem>>;

    /// Replaces a queue item. The status change must follow the item state machine.
    fn update_queue_item(&self, item: SyncQueueItem, expected_version: u64) -> StorageResult<SyncQueueItem>;

    /// Atomically selects up to `claim.max_items` eligible pending items of
    /// one partition ordered by (priority desc, queued_at asc), marks them
    /// `processing`, assigns `claim.batch_id`, and returns them.
    fn claim_pending(&self, claim: &QueueClaim) -> StorageResult<Vec<SyncQueueItem>>;

    /// Lists queue items.
    fn queue_items(&self, filter: &QueueFilter) -> StorageResult<Vec<SyncQueueItem>>;

    /// Removes archived queue items. Returns how many were removed.
    fn delete_queue_items(&self, ids: &[Uuid]) -> StorageResult<usize>;

    /// Inserts a batch.
    fn insert_batch(&self, batch: SyncBatch) -> StorageResult<SyncBatch>;

    /// Reads a batch.
    fn batch(&self, id: Uuid) -> StorageResult<Option<SyncBatch>>;

    /// Replaces a batch.
    fn update_batch(&self, batch: SyncBatch, expected_version: u64) -> StorageResult<SyncBatch>;

    /// Lists a store's batches in creation order.
    fn batches(&self, store_id: StoreId) -> StorageResult<Vec<SyncBatch>>;

    /// Inserts a conflict.
    fn insert_conflict(&self, conflict: SyncConflict) -> StorageResult<SyncConflict>;

    /// Reads a conflict.
    fn conflict(&self, id: Uuid) -> StorageResult<Option<SyncConflict>>;

    /// Replaces a conflict.
    fn update_conflict(&self, conflict: SyncConflict, expected_version: u64) -> StorageResult<SyncConflict>;

    /// Lists conflicts in detection order.
    fn conflicts(&self, filter: &ConflictFilter) -> StorageResult<Vec<SyncConflict>>;

    /// Appends a log entry.
    fn append_log(&self, entry: SyncLogEntry) -> StorageResult<()>;

    /// Lists a store's log entries in append order.
    fn log_entries(&self, store_id: StoreId) -> StorageResult<Vec<SyncLogEntry>>;
}
