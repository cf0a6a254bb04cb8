//! Local entity collaborator.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use storesync_protocol::{EntityKey, EntityType};

/// The local copy of one synchronized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    /// Entity identity.
    pub key: EntityKey,
    /// Serialized state, or `None` for a tombstone.
    pub data: Option<Vec<u8>>,
    /// Last local modification time.
    pub last_modified: DateTime<Utc>,
    /// Remote timestamp last applied or acknowledged.
    pub synced_at: Option<DateTime<Utc>>,
    /// Row version for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

impl LocalRecord {
    /// Creates a live record.
    pub fn new(key: EntityKey, data: Vec<u8>, last_modified: DateTime<Utc>) -> Self {
        Self {
            key,
            data: Some(data),
            last_modified,
            synced_at: None,
            version: 0,
        }
    }

    /// Creates a tombstone.
    pub fn tombstone(key: EntityKey, last_modified: DateTime<Utc>) -> Self {
        Self {
            key,
            data: None,
            last_modified,
            synced_at: None,
            version: 0,
        }
    }

    /// Sets the synced timestamp.
    pub fn with_synced_at(mut self, synced_at: Option<DateTime<Utc>>) -> Self {
        self.synced_at = synced_at;
        self
    }

    /// Returns true for tombstones.
    pub fn is_deleted(&self) -> bool {
        self.data.is_none()
    }
}

/// Read/write access to the node's local entities.
///
/// `put` with `expected_version == 0` requires that the entity does not
/// exist yet.
pub trait EntityStore: Send + Sync {
    /// Reads one entity.
    fn get(&self, key: &EntityKey) -> StorageResult<Option<LocalRecord>>;

    /// Writes one entity and returns the stored row.
    fn put(&self, record: LocalRecord, expected_version: u64) -> StorageResult<LocalRecord>;

    /// Lists every entity of a type ordered by id.
    fn list(&self, entity_type: &EntityType) -> StorageResult<Vec<LocalRecord>>;
}

/// An in-memory [`EntityStore`].
#[derive(Default)]
pub struct InMemoryEntityStore {
    records: RwLock<BTreeMap<EntityKey, LocalRecord>>,
}

impl InMemoryEntityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entities, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl EntityStore for InMemoryEntityStore {
    fn get(&self, key: &EntityKey) -> StorageResult<Option<LocalRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn put(&self, mut record: LocalRecord, expected_version: u64) -> StorageResult<LocalRecord> {
        let mut records = self.records.write();
        let actual = records.get(&record.key).map_or(0, |r| r.version);
        if actual != expected_version {
            return Err(StorageError::version_conflict(
                "entity",
                &record.key,
                expected_version,
                actual,
            ));
        }
        record.version = expected_version + 1;
        records.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    fn list(&self, entity_type: &EntityType) -> StorageResult<Vec<LocalRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| &r.key.entity_type == entity_type)
            .cloned()
            .collect())
    }
}
