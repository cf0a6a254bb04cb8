//! Append-only sync log.

use crate::error::SyncResult;
use std::sync::Arc;
use storesync_protocol::{StoreId, SyncLogEntry};
use storesync_storage::SyncStore;
use tracing::{debug, info, warn};

/// Persists outcome entries and mirrors each one as a tracing event.
///
/// Alerting entries are emitted at `warn`, other failures at `info`,
/// everything else at `debug`.
#[derive(Clone)]
pub struct SyncLog {
    store: Arc<dyn SyncStore>,
}

impl SyncLog {
    /// Creates a log writing to `store`.
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Appends an entry.
    pub fn record(&self, entry: SyncLogEntry) -> SyncResult<()> {
        let store_id = entry.store_id.to_string();
        let entity_type = entry.entity_type.as_ref().map(|t| t.to_string());
        if entry.alert {
            warn!(
                store_id = %store_id,
                entity_type = ?entity_type,
                event = ?entry.event,
                batch_id = ?entry.batch_id,
                item_id = ?entry.queue_item_id,
                "{}",
                entry.message
            );
        } else if !entry.success {
            info!(
                store_id = %store_id,
                entity_type = ?entity_type,
                event = ?entry.event,
                batch_id = ?entry.batch_id,
                item_id = ?entry.queue_item_id,
                "{}",
                entry.message
            );
        } else {
            debug!(
                store_id = %store_id,
                entity_type = ?entity_type,
                event = ?entry.event,
                batch_id = ?entry.batch_id,
                duration_ms = entry.duration_ms,
                "{}",
                entry.message
            );
        }
        self.store.append_log(entry)?;
        Ok(())
    }

    /// Entries of one store in append order.
    pub fn entries(&self, store_id: StoreId) -> SyncResult<Vec<SyncLogEntry>> {
        Ok(self.store.log_entries(store_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use storesync_protocol::LogEvent;
    use storesync_storage::InMemoryStore;

    #[test]
    fn entries_are_persisted_in_order() {
        let log = SyncLog::new(Arc::new(InMemoryStore::new()));
        let store_id = StoreId::new();

        log.record(SyncLogEntry::new(store_id, LogEvent::BatchStarted, "start", Utc::now()))
            .unwrap();
        log.record(
            SyncLogEntry::new(store_id, LogEvent::QueueItemFailed, "gave up", Utc::now()).alerting(),
        )
        .unwrap();

        let entries = log.entries(store_id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, LogEvent::BatchStarted);
        assert!(entries[1].alert);
    }
}
