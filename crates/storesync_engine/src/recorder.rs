//! Local change capture.

use crate::engine::SyncEngine;
use crate::error::SyncResult;
use crate::transport::SyncTransport;
use storesync_protocol::{EntityKey, OperationType, StoreId, SyncQueueItem};

impl<T: SyncTransport> SyncEngine<T> {
    /// Applies a local mutation and queues it for push.
    ///
    /// The local record is written at the current time and the queued item
    /// carries the last remote timestamp the record had seen as its base.
    /// A delete without a payload carries the current local state as its
    /// snapshot. Nothing is written when the change is rejected.
    pub fn record_change(
        &self,
        store_id: StoreId,
        key: EntityKey,
        operation: OperationType,
        payload: Vec<u8>,
        priority: i32,
    ) -> SyncResult<SyncQueueItem> {
        let now = self.clock.now();
        let existing = self.entities.get(&key)?;
        let synced_at = existing.as_ref().and_then(|r| r.synced_at);

        let payload = match (&existing, operation.is_delete() && payload.is_empty()) {
            (Some(record), true) => record.data.clone().unwrap_or_default(),
            _ => payload,
        };
        let mut item = SyncQueueItem::new(store_id, key.clone(), operation, payload, now)
            .with_priority(priority)
            .with_base_timestamp(synced_at);
        self.queue.validate(&mut item)?;

        let data = (!operation.is_delete()).then(|| item.payload.clone());
        self.write_local(&key, data, now, synced_at)?;
        self.queue.submit(item)
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::engine::SyncEngine;
    use crate::error::SyncError;
    use crate::registry::{EntityRegistry, JsonAdapter};
    use crate::transport::MockTransport;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;
    use storesync_protocol::{
        EntityKey, OperationType, StoreId, SyncConfiguration, SyncDirection, SyncEntityRule,
    };
    use storesync_storage::{EntityStore, InMemoryEntityStore, InMemoryStore, SyncStore};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn engine(direction: SyncDirection) -> (SyncEngine<MockTransport>, Arc<InMemoryEntityStore>, StoreId) {
        let store = Arc::new(InMemoryStore::new());
        let entities = Arc::new(InMemoryEntityStore::new());
        let store_id = StoreId::new();
        store.insert_configuration(SyncConfiguration::new(store_id)).unwrap();
        store
            .insert_rule(SyncEntityRule::new(store_id, "product", direction))
            .unwrap();
        let engine = SyncEngine::new(
            store,
            entities.clone(),
            MockTransport::new(),
            EntityRegistry::new().with("product", JsonAdapter),
        )
        .with_clock(Arc::new(ManualClock::new(ts(500))));
        (engine, entities, store_id)
    }

    fn key() -> EntityKey {
        EntityKey::new("product", "p-1")
    }

    #[test]
    fn change_is_written_and_queued() {
        let (engine, entities, store_id) = engine(SyncDirection::Bidirectional);
        let item = engine
            .record_change(store_id, key(), OperationType::Create, br#"{ "b":1, "a":2 }"#.to_vec(), 4)
            .unwrap();

        assert_eq!(item.priority, 4);
        assert_eq!(item.base_timestamp, None);
        assert_eq!(item.payload, br#"{"a":2,"b":1}"#.to_vec());

        let local = entities.get(&key()).unwrap().unwrap();
        assert_eq!(local.data, Some(item.payload.clone()));
        assert_eq!(local.last_modified, ts(500));
    }

    #[test]
    fn base_is_the_last_synced_timestamp() {
        let (engine, entities, store_id) = engine(SyncDirection::Bidirectional);
        engine
            .write_local(&key(), Some(br#"{"a":1}"#.to_vec()), ts(100), Some(ts(90)))
            .unwrap();

        let item = engine
            .record_change(store_id, key(), OperationType::Update, br#"{"a":2}"#.to_vec(), 0)
            .unwrap();
        assert_eq!(item.base_timestamp, Some(ts(90)));
        assert_eq!(entities.get(&key()).unwrap().unwrap().synced_at, Some(ts(90)));
    }

    #[test]
    fn delete_snapshots_current_state() {
        let (engine, entities, store_id) = engine(SyncDirection::Bidirectional);
        engine
            .write_local(&key(), Some(br#"{"a":1}"#.to_vec()), ts(100), None)
            .unwrap();

        let item = engine
            .record_change(store_id, key(), OperationType::Delete, Vec::new(), 0)
            .unwrap();
        assert_eq!(item.payload, br#"{"a":1}"#.to_vec());
        assert!(entities.get(&key()).unwrap().unwrap().is_deleted());
    }

    #[test]
    fn rejected_change_leaves_local_state() {
        let (engine, entities, store_id) = engine(SyncDirection::PullOnly);
        let err = engine
            .record_change(store_id, key(), OperationType::Create, br#"{"a":1}"#.to_vec(), 0)
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(entities.get(&key()).unwrap().is_none());
    }
}
