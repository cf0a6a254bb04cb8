//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up stores backed by
//! in-memory storage and a manual clock.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use storesync_engine::{EntityRegistry, JsonAdapter, ManualClock, SyncEngine, SyncTransport};
use storesync_protocol::{
    ConflictPolicy, EntityKey, EntityType, OperationType, QueueItemStatus, StoreId,
    SyncConfiguration, SyncDirection, SyncEntityRule, SyncQueueItem,
};
use storesync_storage::{
    EntityStore, InMemoryEntityStore, InMemoryStore, LocalRecord, QueueFilter, SyncStore,
};

/// Entity type used by the fixtures.
pub const PRODUCT: &str = "product";

/// Returns the UTC time `secs` seconds after the epoch.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("timestamp in range")
}

/// A registry with a JSON adapter for [`PRODUCT`].
pub fn product_registry() -> EntityRegistry {
    EntityRegistry::new().with(PRODUCT, JsonAdapter)
}

/// A JSON product body.
pub fn product_body(price: u32) -> Vec<u8> {
    format!(r#"{{"price":{price}}}"#).into_bytes()
}

/// One store with its own storage, syncing through `T`.
pub struct StoreNode<T: SyncTransport> {
    /// The engine.
    pub engine: Arc<SyncEngine<T>>,
    /// Sync bookkeeping.
    pub store: Arc<InMemoryStore>,
    /// Local entities.
    pub entities: Arc<InMemoryEntityStore>,
    /// Store id.
    pub store_id: StoreId,
}

impl<T: SyncTransport> StoreNode<T> {
    /// Creates a store syncing [`PRODUCT`] both ways under `policy`.
    pub fn new(transport: T, clock: Arc<ManualClock>, policy: ConflictPolicy) -> Self {
        let store_id = StoreId::new();
        Self::with_setup(
            transport,
            clock,
            SyncConfiguration::new(store_id),
            SyncEntityRule::new(store_id, PRODUCT, SyncDirection::Bidirectional).with_policy(policy),
        )
    }

    /// Creates a store from an explicit configuration and rule.
    pub fn with_setup(
        transport: T,
        clock: Arc<ManualClock>,
        config: SyncConfiguration,
        rule: SyncEntityRule,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let entities = Arc::new(InMemoryEntityStore::new());
        let store_id = config.store_id;
        store
            .insert_configuration(config)
            .expect("Failed to insert configuration");
        store.insert_rule(rule).expect("Failed to insert rule");

        let engine = SyncEngine::new(store.clone(), entities.clone(), transport, product_registry())
            .with_clock(clock);
        Self {
            engine: Arc::new(engine),
            store,
            entities,
            store_id,
        }
    }

    /// Records a product edit.
    pub fn edit(&self, id: &str, price: u32) -> SyncQueueItem {
        self.engine
            .record_change(
                self.store_id,
                EntityKey::new(PRODUCT, id),
                OperationType::Update,
                product_body(price),
                0,
            )
            .expect("Failed to record edit")
    }

    /// Records a product deletion.
    pub fn delete(&self, id: &str) -> SyncQueueItem {
        self.engine
            .record_change(
                self.store_id,
                EntityKey::new(PRODUCT, id),
                OperationType::Delete,
                Vec::new(),
                0,
            )
            .expect("Failed to record delete")
    }

    /// The local copy of a product.
    pub fn local(&self, id: &str) -> Option<LocalRecord> {
        self.entities
            .get(&EntityKey::new(PRODUCT, id))
            .expect("Failed to read entity")
    }

    /// Every local product, ordered by id.
    pub fn products(&self) -> Vec<LocalRecord> {
        self.entities
            .list(&EntityType::new(PRODUCT))
            .expect("Failed to list entities")
    }

    /// Queue items in any of `statuses` (all when empty).
    pub fn queue_items(&self, statuses: &[QueueItemStatus]) -> Vec<SyncQueueItem> {
        self.store
            .queue_items(&QueueFilter::store(self.store_id).statuses(statuses))
            .expect("Failed to list queue items")
    }

    /// Returns true if no change is waiting to be synced.
    pub fn is_idle(&self) -> bool {
        self.queue_items(&[
            QueueItemStatus::Pending,
            QueueItemStatus::Processing,
            QueueItemStatus::Conflicted,
        ])
        .is_empty()
    }
}
