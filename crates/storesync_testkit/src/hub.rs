//! In-process hub for multi-store tests.
//!
//! The hub keeps one authoritative snapshot per entity and answers push
//! and pull batches directly, so several engines can sync against it
//! without a network.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use storesync_engine::{EntityRegistry, SyncResult, SyncTransport};
use storesync_protocol::{
    BatchDirection, EntityKey, EntityType, RecordOutcome, StoreId, SyncBatch, SyncRecord,
};

/// The hub's copy of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct HubRecord {
    /// Serialized state, `None` once deleted.
    pub data: Option<Vec<u8>>,
    /// Modification time of `data`.
    pub timestamp: DateTime<Utc>,
    /// Store that wrote it, `None` for edits made at the hub.
    pub origin: Option<StoreId>,
    /// Hub-wide change sequence number.
    pub seq: u64,
}

#[derive(Default)]
struct HubState {
    records: BTreeMap<EntityKey, HubRecord>,
    seq: u64,
    cursors: HashMap<(StoreId, EntityType), u64>,
    pushes: usize,
    pulls: usize,
}

impl HubState {
    fn write(&mut self, key: EntityKey, data: Option<Vec<u8>>, timestamp: DateTime<Utc>, origin: Option<StoreId>) {
        self.seq += 1;
        let seq = self.seq;
        self.records.insert(
            key,
            HubRecord {
                data,
                timestamp,
                origin,
                seq,
            },
        );
    }
}

/// A hub reachable through [`SyncTransport`].
///
/// A pushed record is accepted when the hub has no copy, when the store
/// had already seen the hub's copy, when both states are equivalent, or
/// when the pushed snapshot is strictly newer. Otherwise the hub answers
/// with its own snapshot. A pull returns every change since the store's
/// last pull that the store did not write itself.
pub struct LoopbackHub {
    state: Mutex<HubState>,
    registry: EntityRegistry,
}

impl LoopbackHub {
    /// Creates an empty hub comparing snapshots through `registry`.
    pub fn new(registry: EntityRegistry) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            registry,
        }
    }

    /// Writes an entity directly at the hub, as headquarters would.
    pub fn edit(&self, key: EntityKey, data: Option<Vec<u8>>, timestamp: DateTime<Utc>) {
        self.state.lock().write(key, data, timestamp, None);
    }

    /// The hub's copy of `key`.
    pub fn get(&self, key: &EntityKey) -> Option<HubRecord> {
        self.state.lock().records.get(key).cloned()
    }

    /// Every entity the hub holds, ordered by key.
    pub fn snapshot(&self) -> Vec<(EntityKey, HubRecord)> {
        self.state
            .lock()
            .records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of push and pull batches served.
    pub fn exchanges(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.pushes, state.pulls)
    }

    fn equivalent(&self, entity_type: &EntityType, a: Option<&[u8]>, b: Option<&[u8]>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => self
                .registry
                .adapter(entity_type)
                .map_or(a == b, |adapter| adapter.equivalent(a, b)),
            _ => false,
        }
    }

    fn accept(&self, state: &mut HubState, batch: &SyncBatch, record: &SyncRecord) -> RecordOutcome {
        let key = EntityKey::new(batch.entity_type.clone(), record.entity_id.clone());
        let data = (!record.operation.is_delete()).then(|| record.data.clone());

        if let Some(current) = state.records.get(&key) {
            let seen = record.base_timestamp.is_some_and(|base| base >= current.timestamp);
            let same = self.equivalent(&key.entity_type, current.data.as_deref(), data.as_deref());
            if !(seen || same || record.entity_timestamp > current.timestamp) {
                let outcome = RecordOutcome::diverged(
                    record.entity_id.clone(),
                    current.data.clone().unwrap_or_default(),
                    current.timestamp,
                );
                return if current.data.is_none() {
                    outcome.as_tombstone()
                } else {
                    outcome
                };
            }
            if same {
                return RecordOutcome::accepted(record.entity_id.clone());
            }
        }

        state.write(key, data, record.entity_timestamp, Some(batch.store_id));
        RecordOutcome::accepted(record.entity_id.clone())
    }

    fn changes_since(&self, state: &mut HubState, batch: &SyncBatch) -> Vec<RecordOutcome> {
        let cursor_key = (batch.store_id, batch.entity_type.clone());
        let cursor = state.cursors.get(&cursor_key).copied().unwrap_or(0);

        let mut changes: Vec<(&EntityKey, &HubRecord)> = state
            .records
            .iter()
            .filter(|(k, r)| k.entity_type == batch.entity_type && r.seq > cursor)
            .collect();
        changes.sort_by_key(|(_, r)| r.seq);
        let latest = changes.last().map_or(cursor, |(_, r)| r.seq);

        let outcomes = changes
            .into_iter()
            .filter(|(_, r)| r.origin != Some(batch.store_id))
            .map(|(k, r)| {
                let outcome = RecordOutcome::incoming(
                    k.entity_id.clone(),
                    r.data.clone().unwrap_or_default(),
                    r.timestamp,
                );
                if r.data.is_none() {
                    outcome.as_tombstone()
                } else {
                    outcome
                }
            })
            .collect();
        state.cursors.insert(cursor_key, latest);
        outcomes
    }
}

impl SyncTransport for LoopbackHub {
    fn send(&self, batch: &SyncBatch, _timeout: Duration) -> SyncResult<Vec<RecordOutcome>> {
        let mut state = self.state.lock();
        match batch.direction {
            BatchDirection::Push => {
                state.pushes += 1;
                Ok(batch
                    .records
                    .iter()
                    .map(|record| self.accept(&mut state, batch, record))
                    .collect())
            }
            BatchDirection::Pull => {
                state.pulls += 1;
                Ok(self.changes_since(&mut state, batch))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{product_registry, ts};
    use storesync_protocol::{OperationType, SyncRecord};

    fn push(store: StoreId, record: SyncRecord) -> SyncBatch {
        let mut batch = SyncBatch::new(store, BatchDirection::Push, EntityType::new("product"));
        batch.push_record(record);
        batch
    }

    fn pull(store: StoreId) -> SyncBatch {
        SyncBatch::new(store, BatchDirection::Pull, EntityType::new("product"))
    }

    fn key() -> EntityKey {
        EntityKey::new("product", "p-1")
    }

    #[test]
    fn newer_push_is_accepted_older_diverges() {
        let hub = LoopbackHub::new(product_registry());
        hub.edit(key(), Some(br#"{"price":1}"#.to_vec()), ts(100));
        let store = StoreId::new();

        let older = SyncRecord::new("p-1", OperationType::Update, br#"{"price":2}"#.to_vec(), ts(50));
        let outcome = hub.send(&push(store, older), Duration::ZERO).unwrap();
        assert!(!outcome[0].success);
        assert_eq!(outcome[0].remote_timestamp, Some(ts(100)));

        let newer = SyncRecord::new("p-1", OperationType::Update, br#"{"price":3}"#.to_vec(), ts(150));
        let outcome = hub.send(&push(store, newer), Duration::ZERO).unwrap();
        assert!(outcome[0].success);
        assert_eq!(hub.get(&key()).unwrap().origin, Some(store));
    }

    #[test]
    fn push_based_on_the_current_copy_is_accepted() {
        let hub = LoopbackHub::new(product_registry());
        hub.edit(key(), Some(br#"{"price":1}"#.to_vec()), ts(100));

        let record = SyncRecord::new("p-1", OperationType::Update, br#"{"price":2}"#.to_vec(), ts(90))
            .with_base_timestamp(Some(ts(100)));
        let outcome = hub.send(&push(StoreId::new(), record), Duration::ZERO).unwrap();
        assert!(outcome[0].success);
        assert_eq!(hub.get(&key()).unwrap().timestamp, ts(90));
    }

    #[test]
    fn pull_skips_own_writes_and_advances() {
        let hub = LoopbackHub::new(product_registry());
        let (a, b) = (StoreId::new(), StoreId::new());
        let record = SyncRecord::new("p-1", OperationType::Create, br#"{"price":1}"#.to_vec(), ts(10));
        hub.send(&push(a, record), Duration::ZERO).unwrap();
        hub.edit(EntityKey::new("product", "p-2"), None, ts(20));

        let for_a = hub.send(&pull(a), Duration::ZERO).unwrap();
        assert_eq!(for_a.len(), 1);
        assert!(for_a[0].deleted);

        let for_b = hub.send(&pull(b), Duration::ZERO).unwrap();
        assert_eq!(for_b.len(), 2);
        assert!(hub.send(&pull(b), Duration::ZERO).unwrap().is_empty());
        assert_eq!(hub.exchanges(), (1, 3));
    }
}
