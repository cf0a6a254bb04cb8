//! Conflict resolution.

use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use serde::{Deserialize, Serialize};
use storesync_protocol::{
    BatchDirection, ConflictResolution, LogEvent, OperationType, QueueItemStatus, SyncConflict,
    SyncEntityRule, SyncLogEntry, SyncQueueItem,
};
use storesync_storage::QueueFilter;
use tracing::{debug, info};

/// Which state survives a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    /// Keep local state.
    Local,
    /// Apply the remote snapshot.
    Remote,
    /// Replace both with an operator-supplied payload.
    Merged(Vec<u8>),
}

impl ResolutionChoice {
    fn resolution(&self) -> ConflictResolution {
        match self {
            ResolutionChoice::Local => ConflictResolution::LocalWins,
            ResolutionChoice::Remote => ConflictResolution::RemoteWins,
            ResolutionChoice::Merged(_) => ConflictResolution::Merged,
        }
    }
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Persists a newly detected conflict and logs it. Conflicts left for
    /// an operator are logged as alerts.
    pub(crate) fn raise_conflict(
        &self,
        rule: &SyncEntityRule,
        conflict: SyncConflict,
    ) -> SyncResult<SyncConflict> {
        let conflict = self.store.insert_conflict(conflict)?;
        let manual = !rule.effective_policy().auto_resolves();
        let mut entry = SyncLogEntry::new(
            conflict.store_id,
            LogEvent::ConflictRaised,
            format!(
                "{} conflict on {}/{} (local {}, remote {})",
                conflict.direction,
                conflict.entity_type,
                conflict.entity_id,
                conflict.local_timestamp,
                conflict.remote_timestamp
            ),
            conflict.detected_at,
        )
        .with_entity_type(&conflict.entity_type)
        .with_conflict(conflict.id)
        .with_success(false);
        if let Some(batch_id) = conflict.batch_id {
            entry = entry.with_batch(batch_id);
        }
        if let Some(item_id) = conflict.queue_item_id {
            entry = entry.with_queue_item(item_id);
        }
        if manual {
            entry = entry.alerting();
        }
        self.log.record(entry)?;
        Ok(conflict)
    }

    /// Settles `conflict` by the rule's policy, or leaves it for review.
    pub(crate) fn auto_resolve(
        &self,
        rule: &SyncEntityRule,
        conflict: SyncConflict,
    ) -> SyncResult<SyncConflict> {
        let policy = rule.effective_policy();
        let Some(resolution) = policy.decide(conflict.local_timestamp, conflict.remote_timestamp)
        else {
            debug!(
                store_id = %conflict.store_id,
                entity_type = %conflict.entity_type,
                conflict_id = %conflict.id,
                "Conflict left for review"
            );
            return Ok(conflict);
        };
        let choice = match resolution {
            ConflictResolution::RemoteWins => ResolutionChoice::Remote,
            _ => ResolutionChoice::Local,
        };
        self.settle(conflict, choice, None, Some(format!("settled by {policy:?} policy")))
    }

    /// Applies `choice` to an unresolved conflict and marks it resolved.
    ///
    /// The conflict row is claimed at its version before any entity or
    /// queue change. Settling a resolved conflict, or losing the claim to
    /// another resolution, returns the stored outcome unchanged.
    pub(crate) fn settle(
        &self,
        mut conflict: SyncConflict,
        choice: ResolutionChoice,
        resolved_by: Option<String>,
        notes: Option<String>,
    ) -> SyncResult<SyncConflict> {
        if conflict.is_resolved() {
            return Ok(conflict);
        }

        let key = conflict.key();
        let now = self.clock.now();
        let merged = match &choice {
            ResolutionChoice::Merged(payload) => Some(
                self.registry
                    .adapter(&key.entity_type)?
                    .canonicalize(payload)
                    .map_err(|e| SyncError::Validation(format!("merged payload for {key}: {e}")))?,
            ),
            _ => None,
        };
        let pushes = self
            .store
            .rule(conflict.store_id, &conflict.entity_type)?
            .is_some_and(|r| r.enabled && r.direction.allows(BatchDirection::Push));

        let conflict_id = conflict.id;
        let expected = conflict.version;
        let resolution = conflict.resolve(choice.resolution(), resolved_by, notes, now);
        let conflict = match self.store.update_conflict(conflict, expected) {
            Ok(claimed) => claimed,
            Err(err) if err.is_version_conflict() => {
                let stored = self
                    .store
                    .conflict(conflict_id)?
                    .ok_or_else(|| SyncError::not_found("conflict", conflict_id))?;
                if stored.is_resolved() {
                    debug!(
                        store_id = %stored.store_id,
                        conflict_id = %stored.id,
                        resolution = ?stored.resolution,
                        "Conflict already resolved elsewhere"
                    );
                    return Ok(stored);
                }
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        self.close_parked_items(&conflict)?;
        match (merged, &choice) {
            (None, ResolutionChoice::Local) => self.reaffirm_local(&conflict, pushes)?,
            (None, _) => {
                self.supersede_open_items(&conflict)?;
                self.write_local(
                    &key,
                    conflict.remote_data.clone(),
                    conflict.remote_timestamp,
                    Some(conflict.remote_timestamp),
                )?;
            }
            (Some(merged), _) => {
                self.supersede_open_items(&conflict)?;
                self.write_local(&key, Some(merged.clone()), now, Some(conflict.remote_timestamp))?;
                if pushes {
                    self.push_resolved(&conflict, OperationType::Update, merged)?;
                }
            }
        }

        if let Some(item_id) = conflict.queue_item_id {
            if self.load_item(item_id)?.status == QueueItemStatus::Conflicted {
                self.complete_item(item_id)?;
            }
        }

        info!(
            store_id = %conflict.store_id,
            entity_type = %conflict.entity_type,
            conflict_id = %conflict.id,
            resolution = ?resolution,
            "Conflict resolved"
        );
        let mut entry = SyncLogEntry::new(
            conflict.store_id,
            LogEvent::ConflictResolved,
            format!(
                "{}/{} resolved {resolution:?} by {}",
                conflict.entity_type,
                conflict.entity_id,
                conflict.resolved_by.as_deref().unwrap_or("policy")
            ),
            now,
        )
        .with_entity_type(&conflict.entity_type)
        .with_conflict(conflict.id);
        if let Some(item_id) = conflict.queue_item_id {
            entry = entry.with_queue_item(item_id);
        }
        self.log.record(entry)?;
        Ok(conflict)
    }

    /// Keeps local state, re-stamped now and marked as having seen the
    /// remote snapshot, and pushes it unless another change is queued.
    fn reaffirm_local(&self, conflict: &SyncConflict, pushes: bool) -> SyncResult<()> {
        let key = conflict.key();
        let now = self.clock.now();
        let data = match self.entities.get(&key)? {
            Some(record) => record.data,
            None => conflict.local_data.clone(),
        };
        self.write_local(&key, data.clone(), now, Some(conflict.remote_timestamp))?;

        if pushes
            && !self
                .queue
                .has_open_change(conflict.store_id, &key, conflict.queue_item_id)?
        {
            match data {
                Some(payload) => self.push_resolved(conflict, OperationType::Update, payload)?,
                None => self.push_resolved(conflict, OperationType::Delete, Vec::new())?,
            };
        }
        Ok(())
    }

    /// Queues the resolved local state for push, based on the remote
    /// snapshot the conflict saw.
    fn push_resolved(
        &self,
        conflict: &SyncConflict,
        operation: OperationType,
        payload: Vec<u8>,
    ) -> SyncResult<SyncQueueItem> {
        let now = self.clock.now();
        let item = SyncQueueItem::new(conflict.store_id, conflict.key(), operation, payload, now)
            .with_entity_timestamp(now)
            .with_base_timestamp(Some(conflict.remote_timestamp));
        self.queue.submit(item)
    }

    /// Holds pending changes to a conflicted entity until an operator
    /// settles the conflict, so none of them is pushed over the state
    /// under review.
    pub(crate) fn park_open_items(&self, conflict: &SyncConflict) -> SyncResult<()> {
        for item in self.pending_items(conflict)? {
            self.update_item(item.id, |item| {
                item.next_retry_at = None;
                Ok(item.transition(QueueItemStatus::Processing)?)
            })?;
            self.update_item(item.id, |item| Ok(item.transition(QueueItemStatus::Conflicted)?))?;
            debug!(
                store_id = %conflict.store_id,
                item_id = %item.id,
                conflict_id = %conflict.id,
                "Parked queued change behind conflict"
            );
        }
        Ok(())
    }

    /// Completes items parked behind `conflict`. The resolution decides
    /// the entity's state, and anything still to push is queued afresh.
    fn close_parked_items(&self, conflict: &SyncConflict) -> SyncResult<()> {
        let filter = QueueFilter::store(conflict.store_id)
            .entity(&conflict.key())
            .statuses(&[QueueItemStatus::Conflicted]);
        for item in self.store.queue_items(&filter)? {
            if Some(item.id) != conflict.queue_item_id {
                self.complete_item(item.id)?;
            }
        }
        Ok(())
    }

    fn pending_items(&self, conflict: &SyncConflict) -> SyncResult<Vec<SyncQueueItem>> {
        let filter = QueueFilter::store(conflict.store_id)
            .entity(&conflict.key())
            .statuses(&[QueueItemStatus::Pending]);
        Ok(self
            .store
            .queue_items(&filter)?
            .into_iter()
            .filter(|item| Some(item.id) != conflict.queue_item_id)
            .collect())
    }

    /// Completes pending items for the conflicted entity other than the
    /// conflict's own item; their state lost to the resolution.
    fn supersede_open_items(&self, conflict: &SyncConflict) -> SyncResult<()> {
        for item in self.pending_items(conflict)? {
            self.update_item(item.id, |item| {
                item.next_retry_at = None;
                Ok(item.transition(QueueItemStatus::Processing)?)
            })?;
            self.update_item(item.id, |item| {
                item.last_error = Some(format!("superseded by conflict {}", conflict.id));
                Ok(item.transition(QueueItemStatus::Completed)?)
            })?;
            debug!(
                store_id = %conflict.store_id,
                item_id = %item.id,
                conflict_id = %conflict.id,
                "Superseded queued change"
            );
        }
        Ok(())
    }
}
