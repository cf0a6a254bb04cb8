//! In-memory storage backend.

use crate::backend::SyncStore;
use crate::error::{StorageError, StorageResult};
use crate::filter::{ConflictFilter, QueueClaim, QueueFilter};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use storesync_protocol::{
    EntityType, ProtocolError, QueueItemStatus, StoreId, SyncBatch, SyncConfiguration,
    SyncConflict, SyncEntityRule, SyncLogEntry, SyncQueueItem,
};
use uuid::Uuid;

/// Rows that carry an optimistic concurrency version.
trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

macro_rules! versioned {
    ($($ty:ty),* $(,)?) => {
        $(impl Versioned for $ty {
            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        })*
    };
}

versioned!(SyncConfiguration, SyncEntityRule, SyncQueueItem, SyncBatch, SyncConflict);

/// Rows keyed by UUID that remember insertion order.
struct Table<T> {
    rows: HashMap<Uuid, T>,
    order: Vec<Uuid>,
}

impl<T: Versioned + Clone> Table<T> {
    fn new() -> Self {
        Self {
            rows: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn insert(&mut self, kind: &'static str, id: Uuid, mut row: T) -> StorageResult<T> {
        if self.rows.contains_key(&id) {
            return Err(StorageError::duplicate(kind, id));
        }
        row.set_version(1);
        self.rows.insert(id, row.clone());
        self.order.push(id);
        Ok(row)
    }

    fn get(&self, id: &Uuid) -> Option<T> {
        self.rows.get(id).cloned()
    }

    fn slot(&mut self, kind: &'static str, id: Uuid, expected: u64) -> StorageResult<&mut T> {
        let row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found(kind, id))?;
        if row.version() != expected {
            return Err(StorageError::version_conflict(kind, id, expected, row.version()));
        }
        Ok(row)
    }

    fn ordered(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|id| self.rows.get(id))
    }

    fn remove(&mut self, id: &Uuid) -> bool {
        if self.rows.remove(id).is_some() {
            self.order.retain(|o| o != id);
            true
        } else {
            false
        }
    }
}

fn replace<T: Versioned + Clone>(slot: &mut T, mut row: T, expected: u64) -> T {
    row.set_version(expected + 1);
    *slot = row.clone();
    row
}

fn check_transition<S: std::fmt::Debug + Copy>(
    entity: &'static str,
    from: S,
    to: S,
    allowed: bool,
) -> StorageResult<()> {
    if allowed {
        Ok(())
    } else {
        Err(ProtocolError::InvalidTransition {
            entity,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
        .into())
    }
}

/// An in-memory [`SyncStore`].
///
/// This backend keeps every row in memory and is suitable for:
/// - Unit and integration tests
/// - Simulations and the command-line scenario runner
///
/// # Thread Safety
///
/// All tables sit behind `parking_lot` locks. `claim_pending` holds the
/// queue's write lock for the whole select-and-mark step, which makes
/// concurrent claims exclusive.
pub struct InMemoryStore {
    configurations: RwLock<HashMap<StoreId, SyncConfiguration>>,
    rules: RwLock<HashMap<(StoreId, EntityType), SyncEntityRule>>,
    queue: RwLock<Table<SyncQueueItem>>,
    batches: RwLock<Table<SyncBatch>>,
    conflicts: RwLock<Table<SyncConflict>>,
    log: Mutex<Vec<SyncLogEntry>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            configurations: RwLock::new(HashMap::new()),
            rules: RwLock::new(HashMap::new()),
            queue: RwLock::new(Table::new()),
            batches: RwLock::new(Table::new()),
            conflicts: RwLock::new(Table::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of queue items of any status.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.read().rows.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore for InMemoryStore {
    fn insert_configuration(&self, mut config: SyncConfiguration) -> StorageResult<SyncConfiguration> {
        let mut configs = self.configurations.write();
        if configs.contains_key(&config.store_id) {
            return Err(StorageError::duplicate("configuration", config.store_id));
        }
        config.version = 1;
        configs.insert(config.store_id, config.clone());
        Ok(config)
    }

    fn configuration(&self, store_id: StoreId) -> StorageResult<Option<SyncConfiguration>> {
        Ok(self.configurations.read().get(&store_id).cloned())
    }

    fn configurations(&self) -> StorageResult<Vec<SyncConfiguration>> {
        let mut all: Vec<_> = self.configurations.read().values().cloned().collect();
        all.sort_by_key(|c| c.store_id);
        Ok(all)
    }

    fn update_configuration(
        &self,
        config: SyncConfiguration,
        expected_version: u64,
    ) -> StorageResult<SyncConfiguration> {
        let mut configs = self.configurations.write();
        let slot = configs
            .get_mut(&config.store_id)
            .ok_or_else(|| StorageError::not_found("configuration", config.store_id))?;
        if slot.version != expected_version {
            return Err(StorageError::version_conflict(
                "configuration",
                config.store_id,
                expected_version,
                slot.version,
            ));
        }
        Ok(replace(slot, config, expected_version))
    }

    fn insert_rule(&self, mut rule: SyncEntityRule) -> StorageResult<SyncEntityRule> {
        if !self.configurations.read().contains_key(&rule.store_id) {
            return Err(StorageError::not_found("configuration", rule.store_id));
        }
        let mut rules = self.rules.write();
        let key = (rule.store_id, rule.entity_type.clone());
        if rules.contains_key(&key) {
            return Err(StorageError::duplicate(
                "entity rule",
                format!("{}:{}", rule.store_id, rule.entity_type),
            ));
        }
        rule.version = 1;
        rules.insert(key, rule.clone());
        Ok(rule)
    }

    fn update_rule(&self, rule: SyncEntityRule, expected_version: u64) -> StorageResult<SyncEntityRule> {
        let mut rules = self.rules.write();
        let key = (rule.store_id, rule.entity_type.clone());
        let slot = rules
            .get_mut(&key)
            .ok_or_else(|| StorageError::not_found("entity rule", &rule.entity_type))?;
        if slot.version != expected_version {
            return Err(StorageError::version_conflict(
                "entity rule",
                &rule.entity_type,
                expected_version,
                slot.version,
            ));
        }
        Ok(replace(slot, rule, expected_version))
    }

    fn rule(&self, store_id: StoreId, entity_type: &EntityType) -> StorageResult<Option<SyncEntityRule>> {
        Ok(self
            .rules
            .read()
            .get(&(store_id, entity_type.clone()))
            .cloned())
    }

    fn rules(&self, store_id: StoreId) -> StorageResult<Vec<SyncEntityRule>> {
        let mut rules: Vec<_> = self
            .rules
            .read()
            .values()
            .filter(|r| r.store_id == store_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        Ok(rules)
    }

    fn insert_queue_item(&self, item: SyncQueueItem) -> StorageResult<SyncQueueItem> {
        self.queue.write().insert("queue item", item.id, item)
    }

    fn queue_item(&self, id: Uuid) -> StorageResult<Option<SyncQueueItem>> {
        Ok(self.queue.read().get(&id))
    }

    fn update_queue_item(&self, item: SyncQueueItem, expected_version: u64) -> StorageResult<SyncQueueItem> {
        let mut queue = self.queue.write();
        let slot = queue.slot("queue item", item.id, expected_version)?;
        if slot.status != item.status {
            check_transition(
                "queue item",
                slot.status,
                item.status,
                slot.status.can_transition_to(item.status),
            )?;
        }
        Ok(replace(slot, item, expected_version))
    }

    fn claim_pending(&self, claim: &QueueClaim) -> StorageResult<Vec<SyncQueueItem>> {
        let mut queue = self.queue.write();

        let mut selected: Vec<(i32, chrono::DateTime<chrono::Utc>, Uuid)> = queue
            .rows
            .values()
            .filter(|item| claim.selects(item))
            .map(|item| (item.priority, item.queued_at, item.id))
            .collect();
        selected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        selected.truncate(claim.max_items);

        let mut claimed = Vec::with_capacity(selected.len());
        for (_, _, id) in selected {
            if let Some(item) = queue.rows.get_mut(&id) {
                item.status = QueueItemStatus::Processing;
                item.batch_id = Some(claim.batch_id);
                item.version += 1;
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    fn queue_items(&self, filter: &QueueFilter) -> StorageResult<Vec<SyncQueueItem>> {
        Ok(self
            .queue
            .read()
            .ordered()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect())
    }

    fn delete_queue_items(&self, ids: &[Uuid]) -> StorageResult<usize> {
        let mut queue = self.queue.write();
        Ok(ids.iter().filter(|id| queue.remove(id)).count())
    }

    fn insert_batch(&self, batch: SyncBatch) -> StorageResult<SyncBatch> {
        self.batches.write().insert("batch", batch.id, batch)
    }

    fn batch(&self, id: Uuid) -> StorageResult<Option<SyncBatch>> {
        Ok(self.batches.read().get(&id))
    }

    fn update_batch(&self, batch: SyncBatch, expected_version: u64) -> StorageResult<SyncBatch> {
        let mut batches = self.batches.write();
        let slot = batches.slot("batch", batch.id, expected_version)?;
        if slot.status != batch.status {
            check_transition(
                "batch",
                slot.status,
                batch.status,
                slot.status.can_transition_to(batch.status),
            )?;
        }
        Ok(replace(slot, batch, expected_version))
    }

    fn batches(&self, store_id: StoreId) -> StorageResult<Vec<SyncBatch>> {
        Ok(self
            .batches
            .read()
            .ordered()
            .filter(|b| b.store_id == store_id)
            .cloned()
            .collect())
    }

    fn insert_conflict(&self, conflict: SyncConflict) -> StorageResult<SyncConflict> {
        self.conflicts.write().insert("conflict", conflict.id, conflict)
    }

    fn conflict(&self, id: Uuid) -> StorageResult<Option<SyncConflict>> {
        Ok(self.conflicts.read().get(&id))
    }

    fn update_conflict(&self, conflict: SyncConflict, expected_version: u64) -> StorageResult<SyncConflict> {
        let mut conflicts = self.conflicts.write();
        let slot = conflicts.slot("conflict", conflict.id, expected_version)?;
        Ok(replace(slot, conflict, expected_version))
    }

    fn conflicts(&self, filter: &ConflictFilter) -> StorageResult<Vec<SyncConflict>> {
        Ok(self
            .conflicts
            .read()
            .ordered()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    fn append_log(&self, entry: SyncLogEntry) -> StorageResult<()> {
        self.log.lock().push(entry);
        Ok(())
    }

    fn log_entries(&self, store_id: StoreId) -> StorageResult<Vec<SyncLogEntry>> {
        Ok(self
            .log
            .lock()
            .iter()
            .filter(|e| e.store_id == store_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::HashSet;
    use std::sync::Arc;
    use storesync_protocol::{BatchDirection, EntityKey, OperationType, SyncDirection};

    fn store_with_config() -> (InMemoryStore, StoreId) {
        let store = InMemoryStore::new();
        let store_id = StoreId::new();
        store
            .insert_configuration(SyncConfiguration::new(store_id))
            .unwrap();
        (store, store_id)
    }

    fn item(store_id: StoreId, id: &str, priority: i32, queued_secs: i64) -> SyncQueueItem {
        let base = Utc::now() - Duration::seconds(3600);
        SyncQueueItem::new(
            store_id,
            EntityKey::new("product", id),
            OperationType::Update,
            id.as_bytes().to_vec(),
            base + Duration::seconds(queued_secs),
        )
        .with_priority(priority)
    }

    fn claim(store_id: StoreId, max_items: usize) -> QueueClaim {
        QueueClaim {
            store_id,
            direction: BatchDirection::Push,
            entity_type: EntityType::new("product"),
            max_items,
            batch_id: Uuid::new_v4(),
            now: Utc::now(),
        }
    }

    #[test]
    fn update_requires_expected_version() {
        let (store, store_id) = store_with_config();
        let config = store.configuration(store_id).unwrap().unwrap();

        let updated = store
            .update_configuration(config.clone().with_max_batch_size(7), 1)
            .unwrap();
        assert_eq!(updated.version, 2);

        let err = store
            .update_configuration(config.with_max_batch_size(9), 1)
            .unwrap_err();
        assert!(err.is_version_conflict());
        assert_eq!(
            store.configuration(store_id).unwrap().unwrap().max_batch_size,
            7
        );
    }

    #[test]
    fn one_rule_per_entity_type() {
        let (store, store_id) = store_with_config();
        store
            .insert_rule(SyncEntityRule::new(store_id, "product", SyncDirection::Bidirectional))
            .unwrap();
        let err = store
            .insert_rule(SyncEntityRule::new(store_id, "product", SyncDirection::PushOnly))
            .unwrap_err();
        assert!(matches!(err, StorageError::Duplicate { .. }));
    }

    #[test]
    fn rule_requires_configuration() {
        let store = InMemoryStore::new();
        let err = store
            .insert_rule(SyncEntityRule::new(StoreId::new(), "product", SyncDirection::PushOnly))
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[test]
    fn claim_orders_by_priority_then_age() {
        let (store, store_id) = store_with_config();
        store.insert_queue_item(item(store_id, "c", 5, 3)).unwrap();
        store.insert_queue_item(item(store_id, "b", 5, 2)).unwrap();
        store.insert_queue_item(item(store_id, "a", 10, 5)).unwrap();

        let claimed = store.claim_pending(&claim(store_id, 2)).unwrap();
        let ids: Vec<_> = claimed.iter().map(|i| i.entity_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(claimed
            .iter()
            .all(|i| i.status == QueueItemStatus::Processing && i.version == 2));
    }

    #[test]
    fn claim_skips_items_waiting_for_retry() {
        let (store, store_id) = store_with_config();
        let mut waiting = item(store_id, "a", 1, 0);
        waiting.next_retry_at = Some(Utc::now() + Duration::seconds(60));
        store.insert_queue_item(waiting).unwrap();

        assert!(store.claim_pending(&claim(store_id, 10)).unwrap().is_empty());
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        let (store, store_id) = store_with_config();
        for i in 0..200 {
            store
                .insert_queue_item(item(store_id, &format!("p-{i}"), i % 7, i64::from(i)))
                .unwrap();
        }
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    loop {
                        let claimed = store.claim_pending(&claim(store_id, 7)).unwrap();
                        if claimed.is_empty() {
                            break;
                        }
                        mine.extend(claimed.into_iter().map(|i| i.id));
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "item {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn queue_update_enforces_state_machine() {
        let (store, store_id) = store_with_config();
        let inserted = store.insert_queue_item(item(store_id, "a", 0, 0)).unwrap();

        let mut completed = inserted.clone();
        completed.status = QueueItemStatus::Completed;
        let err = store.update_queue_item(completed, inserted.version).unwrap_err();
        assert!(matches!(err, StorageError::Protocol(_)));
    }

    #[test]
    fn log_is_append_only_per_store() {
        let (store, store_id) = store_with_config();
        let other = StoreId::new();
        for (sid, msg) in [(store_id, "one"), (other, "x"), (store_id, "two")] {
            store
                .append_log(SyncLogEntry::new(
                    sid,
                    storesync_protocol::LogEvent::BatchStarted,
                    msg,
                    Utc::now(),
                ))
                .unwrap();
        }
        let entries = store.log_entries(store_id).unwrap();
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["one", "two"]);
    }
}
