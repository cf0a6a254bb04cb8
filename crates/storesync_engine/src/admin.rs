//! Operator-facing controls and status.

use crate::engine::{CycleReport, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::resolver::ResolutionChoice;
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use storesync_protocol::{
    BatchDirection, BatchStatus, LogEvent, QueueItemStatus, StoreId, SyncBatch, SyncConflict,
    SyncLogEntry, SyncQueueItem,
};
use storesync_storage::{ConflictFilter, QueueFilter};
use tracing::{debug, info};
use uuid::Uuid;

/// Seconds past the transport timeout before an in-flight batch left by
/// a stopped worker is reclaimed.
pub const ORPHAN_LEASE_MARGIN_SECS: i64 = 60;

/// An operator's decision on a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualResolution {
    /// Conflict to resolve.
    pub conflict_id: Uuid,
    /// Surviving state.
    pub choice: ResolutionChoice,
    /// Operator identity.
    pub resolved_by: String,
    /// Free-form note.
    #[serde(default)]
    pub note: Option<String>,
}

/// Queue items of one store by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Waiting to be batched.
    pub pending: usize,
    /// In flight.
    pub processing: usize,
    /// Done.
    pub completed: usize,
    /// Attempt ceiling reached.
    pub failed: usize,
    /// Waiting on a conflict.
    pub conflicted: usize,
}

impl QueueCounts {
    fn add(&mut self, status: QueueItemStatus) {
        match status {
            QueueItemStatus::Pending => self.pending += 1,
            QueueItemStatus::Processing => self.processing += 1,
            QueueItemStatus::Completed => self.completed += 1,
            QueueItemStatus::Failed => self.failed += 1,
            QueueItemStatus::Conflicted => self.conflicted += 1,
        }
    }
}

/// Sync health of one store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    /// Store.
    pub store_id: StoreId,
    /// False while paused.
    pub enabled: bool,
    /// Queue items by status.
    pub queue: QueueCounts,
    /// Conflicts awaiting an operator.
    pub unresolved_conflicts: usize,
    /// Alert entries in the sync log.
    pub alerts: usize,
    /// Last cycle without a failed batch.
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Last cycle started.
    pub last_attempted_sync: Option<DateTime<Utc>>,
    /// Failure text of the last cycle.
    pub last_error: Option<String>,
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Conflicts of `store_id` awaiting an operator, oldest first.
    pub fn unresolved_conflicts(&self, store_id: StoreId) -> SyncResult<Vec<SyncConflict>> {
        Ok(self.store.conflicts(&ConflictFilter::unresolved(store_id))?)
    }

    /// Resolves a conflict by hand. Resolving it again returns the first
    /// outcome unchanged.
    pub fn resolve_conflict(&self, request: ManualResolution) -> SyncResult<SyncConflict> {
        let conflict = self
            .store
            .conflict(request.conflict_id)?
            .ok_or_else(|| SyncError::not_found("conflict", request.conflict_id))?;
        self.settle(
            conflict,
            request.choice,
            Some(request.resolved_by),
            request.note,
        )
    }

    /// Stops cycles for `store_id` until [`resume`](Self::resume).
    pub fn pause(&self, store_id: StoreId) -> SyncResult<()> {
        self.set_enabled(store_id, false)
    }

    /// Re-enables cycles for `store_id`.
    pub fn resume(&self, store_id: StoreId) -> SyncResult<()> {
        self.set_enabled(store_id, true)
    }

    fn set_enabled(&self, store_id: StoreId, enabled: bool) -> SyncResult<()> {
        let before = self.load_config(store_id)?;
        if before.enabled == enabled {
            return Ok(());
        }
        self.update_config(store_id, |c| c.enabled = enabled)?;
        let (event, message) = if enabled {
            (LogEvent::SyncResumed, "sync resumed")
        } else {
            (LogEvent::SyncPaused, "sync paused")
        };
        info!(store_id = %store_id, "{message}");
        self.log
            .record(SyncLogEntry::new(store_id, event, message, self.clock.now()))
    }

    /// Runs a cycle now, outside the schedule.
    pub fn force_cycle(&self, store_id: StoreId) -> SyncResult<CycleReport> {
        self.run_cycle(store_id)
    }

    /// Requests cancellation of a batch.
    ///
    /// An in-flight batch becomes `cancelling`; the cycle running it
    /// returns its unconfirmed items to the queue and ends it `cancelled`.
    /// A batch that never started is cancelled directly.
    pub fn cancel_batch(&self, batch_id: Uuid) -> SyncResult<SyncBatch> {
        let mut batch = self.load_batch(batch_id)?;
        let expected = batch.version;
        match batch.status {
            BatchStatus::Cancelling => return Ok(batch),
            BatchStatus::Pending => {
                batch.transition(BatchStatus::Cancelled)?;
                batch.completed_at = Some(self.clock.now());
            }
            _ => batch.transition(BatchStatus::Cancelling)?,
        }
        let batch = self.store.update_batch(batch, expected)?;
        info!(
            store_id = %batch.store_id,
            batch_id = %batch.id,
            status = ?batch.status,
            "Batch cancellation requested"
        );
        Ok(batch)
    }

    /// Queue, conflict and log summary for `store_id`.
    pub fn status(&self, store_id: StoreId) -> SyncResult<StoreStatus> {
        let config = self.load_config(store_id)?;
        let mut queue = QueueCounts::default();
        for item in self.store.queue_items(&QueueFilter::store(store_id))? {
            queue.add(item.status);
        }
        let alerts = self
            .log
            .entries(store_id)?
            .iter()
            .filter(|e| e.alert)
            .count();
        Ok(StoreStatus {
            store_id,
            enabled: config.enabled,
            queue,
            unresolved_conflicts: self.unresolved_conflicts(store_id)?.len(),
            alerts,
            last_successful_sync: config.last_successful_sync,
            last_attempted_sync: config.last_attempted_sync,
            last_error: config.last_error,
        })
    }

    /// Deletes completed items queued before `older_than`. Returns how
    /// many were removed.
    pub fn purge_completed(&self, store_id: StoreId, older_than: DateTime<Utc>) -> SyncResult<usize> {
        let filter = QueueFilter::store(store_id).statuses(&[QueueItemStatus::Completed]);
        let ids: Vec<Uuid> = self
            .store
            .queue_items(&filter)?
            .into_iter()
            .filter(|item| item.queued_at < older_than)
            .map(|item| item.id)
            .collect();
        let purged = self.store.delete_queue_items(&ids)?;
        info!(store_id = %store_id, purged, "Purged completed queue items");
        Ok(purged)
    }

    /// Returns `processing` items no running cycle owns to `pending`
    /// without consuming an attempt, and closes the batches they were
    /// stranded in. Returns how many items were recovered.
    ///
    /// Ownership is read from storage: an item belongs to a live cycle,
    /// possibly on another worker, while its batch is in flight and was
    /// started less than the transport timeout plus
    /// [`ORPHAN_LEASE_MARGIN_SECS`] ago.
    pub fn recover_orphaned(&self, store_id: StoreId) -> SyncResult<usize> {
        let config = self.load_config(store_id)?;
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(config.transport_timeout())
            .unwrap_or_else(|_| chrono::Duration::days(365))
            + chrono::Duration::seconds(ORPHAN_LEASE_MARGIN_SECS);

        let filter = QueueFilter::store(store_id).statuses(&[QueueItemStatus::Processing]);
        let mut batches = BTreeSet::new();
        let mut recovered = 0;
        for item in self.store.queue_items(&filter)? {
            let key = (store_id, BatchDirection::Push, item.entity_type.clone());
            if self.flights.is_active(&key) {
                continue;
            }
            let batch = match item.batch_id {
                Some(batch_id) => self.store.batch(batch_id)?,
                None => None,
            };
            if let Some(batch) = &batch {
                let in_flight = matches!(batch.status, BatchStatus::InProgress | BatchStatus::Cancelling);
                if in_flight && batch.started_at.is_some_and(|at| now < at + lease) {
                    debug!(
                        store_id = %store_id,
                        item_id = %item.id,
                        batch_id = %batch.id,
                        "Queue item is held by a live batch"
                    );
                    continue;
                }
                batches.insert(batch.id);
            }
            self.release_item(item.id)?;
            recovered += 1;
        }

        for batch_id in batches {
            let mut batch = self.load_batch(batch_id)?;
            let expected = batch.version;
            match batch.status {
                BatchStatus::InProgress => {
                    batch.fail_unprocessed("orphaned by an interrupted cycle", now);
                    batch.finish(now)?;
                }
                BatchStatus::Cancelling => {
                    batch.transition(BatchStatus::Cancelled)?;
                    batch.completed_at = Some(now);
                }
                _ => continue,
            }
            self.store.update_batch(batch, expected)?;
        }

        if recovered > 0 {
            info!(store_id = %store_id, recovered, "Recovered orphaned queue items");
        }
        Ok(recovered)
    }

    /// Puts a failed item back in the queue with a fresh attempt budget.
    pub fn retry_failed(&self, item_id: Uuid) -> SyncResult<SyncQueueItem> {
        let item = self.update_item(item_id, |item| {
            item.transition(QueueItemStatus::Pending)?;
            item.attempts = 0;
            item.next_retry_at = None;
            item.batch_id = None;
            Ok(())
        })?;
        self.log.record(
            SyncLogEntry::new(
                item.store_id,
                LogEvent::QueueItemRetried,
                "failed item requeued by operator",
                self.clock.now(),
            )
            .with_entity_type(&item.entity_type)
            .with_queue_item(item.id),
        )?;
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::{EntityRegistry, JsonAdapter};
    use crate::transport::{MockReply, MockTransport};
    use chrono::TimeZone;
    use std::sync::Arc;
    use storesync_protocol::{
        ConflictPolicy, ConflictResolution, EntityKey, OperationType, RecordOutcome,
        SyncConfiguration, SyncDirection, SyncEntityRule,
    };
    use storesync_storage::{EntityStore, InMemoryEntityStore, InMemoryStore, SyncStore};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    struct Node {
        engine: SyncEngine<MockTransport>,
        store: Arc<InMemoryStore>,
        entities: Arc<InMemoryEntityStore>,
        clock: Arc<ManualClock>,
        store_id: StoreId,
    }

    fn node(config: SyncConfiguration, policy: ConflictPolicy) -> Node {
        let store = Arc::new(InMemoryStore::new());
        let entities = Arc::new(InMemoryEntityStore::new());
        let clock = Arc::new(ManualClock::new(ts(1_000)));
        let store_id = config.store_id;
        store.insert_configuration(config).unwrap();
        store
            .insert_rule(
                SyncEntityRule::new(store_id, "product", SyncDirection::Bidirectional)
                    .with_policy(policy),
            )
            .unwrap();
        let engine = SyncEngine::new(
            store.clone(),
            entities.clone(),
            MockTransport::new(),
            EntityRegistry::new().with("product", JsonAdapter),
        )
        .with_clock(clock.clone());
        Node {
            engine,
            store,
            entities,
            clock,
            store_id,
        }
    }

    fn change(n: &Node, id: &str) -> SyncQueueItem {
        n.engine
            .record_change(
                n.store_id,
                EntityKey::new("product", id),
                OperationType::Update,
                br#"{"price":1}"#.to_vec(),
                0,
            )
            .unwrap()
    }

    #[test]
    fn manual_resolution_completes_conflicted_item() {
        let n = node(SyncConfiguration::new(StoreId::new()), ConflictPolicy::ManualReview);
        let item = change(&n, "p-1");
        n.engine.transport().reply_to_push(MockReply::Outcomes(vec![RecordOutcome::diverged(
            "p-1",
            br#"{"price":2}"#.to_vec(),
            ts(900),
        )]));
        n.engine.run_cycle(n.store_id).unwrap();

        let conflicts = n.engine.unresolved_conflicts(n.store_id).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            n.store.queue_item(item.id).unwrap().unwrap().status,
            QueueItemStatus::Conflicted
        );

        let resolved = n
            .engine
            .resolve_conflict(ManualResolution {
                conflict_id: conflicts[0].id,
                choice: ResolutionChoice::Remote,
                resolved_by: "ops@hq".into(),
                note: Some("price list wins".into()),
            })
            .unwrap();
        assert_eq!(resolved.resolution, Some(ConflictResolution::RemoteWins));
        assert_eq!(
            n.store.queue_item(item.id).unwrap().unwrap().status,
            QueueItemStatus::Completed
        );
        let local = n.entities.get(&EntityKey::new("product", "p-1")).unwrap().unwrap();
        assert_eq!(local.data.as_deref(), Some(br#"{"price":2}"#.as_slice()));
        assert!(n.engine.unresolved_conflicts(n.store_id).unwrap().is_empty());
    }

    #[test]
    fn unknown_conflict_is_not_found() {
        let n = node(SyncConfiguration::new(StoreId::new()), ConflictPolicy::ManualReview);
        let err = n
            .engine
            .resolve_conflict(ManualResolution {
                conflict_id: Uuid::new_v4(),
                choice: ResolutionChoice::Local,
                resolved_by: "ops".into(),
                note: None,
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[test]
    fn pause_and_resume_are_logged() {
        let store_id = StoreId::new();
        let n = node(SyncConfiguration::new(store_id), ConflictPolicy::LocalWins);
        n.engine.pause(store_id).unwrap();
        n.engine.pause(store_id).unwrap();
        assert!(n.engine.run_cycle(store_id).unwrap().paused);
        assert!(!n.engine.status(store_id).unwrap().enabled);

        n.engine.resume(store_id).unwrap();
        assert!(!n.engine.run_cycle(store_id).unwrap().paused);

        let events: Vec<_> = n
            .store
            .log_entries(store_id)
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .filter(|e| matches!(e, LogEvent::SyncPaused | LogEvent::SyncResumed))
            .collect();
        assert_eq!(events, [LogEvent::SyncPaused, LogEvent::SyncResumed]);
    }

    #[test]
    fn status_counts_queue_and_alerts() {
        let store_id = StoreId::new();
        let n = node(
            SyncConfiguration::new(store_id).with_retry_attempts(1),
            ConflictPolicy::LocalWins,
        );
        change(&n, "p-1");
        change(&n, "p-2");
        n.engine.transport().reply_to_push(MockReply::Outcomes(vec![
            RecordOutcome::accepted("p-1"),
            RecordOutcome::rejected("p-2", "bad sku"),
        ]));
        n.engine.run_cycle(store_id).unwrap();

        let status = n.engine.status(store_id).unwrap();
        assert_eq!(status.queue.completed, 1);
        assert_eq!(status.queue.failed, 1);
        assert_eq!(status.alerts, 1);
        assert_eq!(status.last_successful_sync, Some(ts(1_000)));
    }

    #[test]
    fn retry_failed_resets_attempts() {
        let store_id = StoreId::new();
        let n = node(
            SyncConfiguration::new(store_id).with_retry_attempts(1),
            ConflictPolicy::LocalWins,
        );
        let item = change(&n, "p-1");
        n.engine.transport().reply_to_push(MockReply::Failure {
            message: "down".into(),
            retryable: true,
        });
        n.engine.run_cycle(store_id).unwrap();
        assert_eq!(
            n.store.queue_item(item.id).unwrap().unwrap().status,
            QueueItemStatus::Failed
        );

        let item = n.engine.retry_failed(item.id).unwrap();
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.attempts, 0);

        n.engine.run_cycle(store_id).unwrap();
        assert_eq!(
            n.store.queue_item(item.id).unwrap().unwrap().status,
            QueueItemStatus::Completed
        );
    }

    #[test]
    fn purge_removes_old_completed_items() {
        let store_id = StoreId::new();
        let n = node(SyncConfiguration::new(store_id), ConflictPolicy::LocalWins);
        change(&n, "p-1");
        n.engine.run_cycle(store_id).unwrap();
        n.clock.advance(chrono::Duration::hours(1));
        change(&n, "p-2");

        assert_eq!(n.engine.purge_completed(store_id, ts(1_000)).unwrap(), 0);
        assert_eq!(n.engine.purge_completed(store_id, ts(2_000)).unwrap(), 1);
        assert_eq!(n.engine.status(store_id).unwrap().queue.pending, 1);
    }

    #[test]
    fn orphaned_items_return_to_pending() {
        let store_id = StoreId::new();
        let n = node(SyncConfiguration::new(store_id), ConflictPolicy::LocalWins);
        let item = change(&n, "p-1");

        let mut batch = SyncBatch::new(store_id, BatchDirection::Push, "product".into());
        let claimed = n
            .engine
            .queue()
            .dequeue_batch(store_id, BatchDirection::Push, &batch.entity_type, 10, batch.id)
            .unwrap();
        for item in &claimed {
            batch.push_record(storesync_protocol::SyncRecord::from_queue_item(item));
        }
        batch.start(ts(1_000)).unwrap();
        let batch = n.store.insert_batch(batch).unwrap();

        // Still inside its lease: another worker may be exchanging it.
        n.clock.advance(chrono::Duration::seconds(30));
        assert_eq!(n.engine.recover_orphaned(store_id).unwrap(), 0);
        assert_eq!(
            n.store.queue_item(item.id).unwrap().unwrap().status,
            QueueItemStatus::Processing
        );

        n.clock
            .advance(chrono::Duration::seconds(ORPHAN_LEASE_MARGIN_SECS));
        assert_eq!(n.engine.recover_orphaned(store_id).unwrap(), 1);
        let item = n.store.queue_item(item.id).unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert_eq!(
            n.store.batch(batch.id).unwrap().unwrap().status,
            BatchStatus::Failed
        );
    }

    #[test]
    fn cancelling_a_finished_batch_is_rejected() {
        let store_id = StoreId::new();
        let n = node(SyncConfiguration::new(store_id), ConflictPolicy::LocalWins);
        change(&n, "p-1");
        let report = n.engine.run_cycle(store_id).unwrap();

        let err = n.engine.cancel_batch(report.batches[0].batch_id).unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
    }
}
