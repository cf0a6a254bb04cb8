//! Sync cycle orchestration.

use crate::clock::{Clock, SystemClock};
use crate::detector::{classify, Classification, Incoming};
use crate::error::{SyncError, SyncResult};
use crate::log::SyncLog;
use crate::queue::SyncQueue;
use crate::registry::EntityRegistry;
use crate::retry::{RetryPolicy, RetryStep};
use crate::single_flight::{FlightKey, SingleFlight};
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storesync_protocol::{
    encode_records, BatchDirection, BatchStatus, EntityKey, EntityType, LogEvent, OperationType,
    QueueItemStatus, RecordOutcome, StoreId, SyncBatch, SyncConfiguration, SyncConflict,
    SyncEntityRule, SyncLogEntry, SyncQueueItem, SyncRecord,
};
use storesync_storage::{EntityStore, LocalRecord, SyncStore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Summary of one batch exchanged during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    /// Batch id.
    pub batch_id: Uuid,
    /// Entity type.
    pub entity_type: EntityType,
    /// Push or pull.
    pub direction: BatchDirection,
    /// Final status.
    pub status: BatchStatus,
    /// Records in the batch.
    pub records: u32,
    /// Successful records.
    pub succeeded: u32,
    /// Failed records.
    pub failed: u32,
    /// Conflicted records.
    pub conflicts: u32,
    /// Batch-level failure text.
    pub error: Option<String>,
}

impl From<&SyncBatch> for BatchReport {
    fn from(batch: &SyncBatch) -> Self {
        Self {
            batch_id: batch.id,
            entity_type: batch.entity_type.clone(),
            direction: batch.direction,
            status: batch.status,
            records: batch.record_count,
            succeeded: batch.success_count,
            failed: batch.failed_count,
            conflicts: batch.conflict_count,
            error: batch.error.clone(),
        }
    }
}

/// A partition skipped because another cycle held it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPartition {
    /// Entity type.
    pub entity_type: EntityType,
    /// Direction.
    pub direction: BatchDirection,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// Store the cycle ran for.
    pub store_id: StoreId,
    /// The store is paused; nothing ran.
    pub paused: bool,
    /// Batches exchanged, in execution order.
    pub batches: Vec<BatchReport>,
    /// Partitions skipped by the single-flight guard.
    pub skipped: Vec<SkippedPartition>,
    /// Errors that ended a partition early or failed a batch.
    pub errors: Vec<String>,
    /// Duration of the cycle in milliseconds.
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            paused: false,
            batches: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Returns true if the cycle exchanged nothing.
    pub fn is_noop(&self) -> bool {
        self.batches.is_empty() && self.skipped.is_empty() && self.errors.is_empty()
    }

    /// Returns true if no batch failed and no partition errored.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The sync engine drives queue items through batches, applies incoming
/// state and settles conflicts.
///
/// One engine serves every store configured in its [`SyncStore`]; the
/// [`EntityStore`] is the node's local copy of synchronized entities.
///
/// ## Key Invariants
///
/// - Within a rule, pull happens before push
/// - At most one batch per (store, direction, entity type) is in flight
/// - Item failures never abort a batch; batches end with mixed counters
/// - Every failure ends in a persisted status plus a log entry
pub struct SyncEngine<T: SyncTransport> {
    pub(crate) store: Arc<dyn SyncStore>,
    pub(crate) entities: Arc<dyn EntityStore>,
    pub(crate) transport: T,
    pub(crate) registry: Arc<EntityRegistry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) queue: SyncQueue,
    pub(crate) log: SyncLog,
    pub(crate) flights: SingleFlight<FlightKey>,
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Creates a new sync engine on the system clock.
    pub fn new(
        store: Arc<dyn SyncStore>,
        entities: Arc<dyn EntityStore>,
        transport: T,
        registry: EntityRegistry,
    ) -> Self {
        let registry = Arc::new(registry);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            queue: SyncQueue::new(Arc::clone(&store), Arc::clone(&registry), Arc::clone(&clock)),
            log: SyncLog::new(Arc::clone(&store)),
            store,
            entities,
            transport,
            registry,
            clock,
            flights: SingleFlight::new(),
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.queue = SyncQueue::new(Arc::clone(&self.store), Arc::clone(&self.registry), Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// The outbound queue.
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// The sync log.
    pub fn log(&self) -> &SyncLog {
        &self.log
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The entity registry.
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// The sync bookkeeping store.
    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// The local entity store.
    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    /// Current time on the engine's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Runs one sync cycle for `store_id`.
    ///
    /// Enabled rules run in priority order (ties by entity type name); for
    /// each rule every allowed direction gets at most one batch, pull
    /// first. A partition that is already in flight is skipped and logged.
    pub fn run_cycle(&self, store_id: StoreId) -> SyncResult<CycleReport> {
        let started = Instant::now();
        let config = self.load_config(store_id)?;
        let mut report = CycleReport::new(store_id);
        if !config.enabled {
            debug!(store_id = %store_id, "Store paused, skipping cycle");
            report.paused = true;
            return Ok(report);
        }

        let attempted_at = self.clock.now();
        let config = self.update_config(store_id, |c| c.last_attempted_sync = Some(attempted_at))?;

        let mut rules: Vec<_> = self
            .store
            .rules(store_id)?
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.entity_type.cmp(&b.entity_type))
        });

        for rule in &rules {
            for &direction in rule.direction.batch_directions() {
                let key = (store_id, direction, rule.entity_type.clone());
                let Some(_flight) = self.flights.try_acquire(key) else {
                    self.log.record(
                        SyncLogEntry::new(
                            store_id,
                            LogEvent::CycleSkipped,
                            format!("{direction} {} already in flight", rule.entity_type),
                            self.clock.now(),
                        )
                        .with_entity_type(&rule.entity_type),
                    )?;
                    report.skipped.push(SkippedPartition {
                        entity_type: rule.entity_type.clone(),
                        direction,
                    });
                    continue;
                };

                let outcome = match direction {
                    BatchDirection::Pull => self.pull_batch(&config, rule),
                    BatchDirection::Push => self.push_batch(&config, rule),
                };
                match outcome {
                    Ok(Some(batch)) => {
                        if batch.status == BatchStatus::Failed {
                            report.errors.push(format!(
                                "{direction} {}: {}",
                                rule.entity_type,
                                batch.error.as_deref().unwrap_or("every record failed")
                            ));
                        }
                        report.batches.push(batch);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            store_id = %store_id,
                            entity_type = %rule.entity_type,
                            direction = %direction,
                            error = %err,
                            "Sync partition failed"
                        );
                        report.errors.push(format!("{direction} {}: {err}", rule.entity_type));
                    }
                }
            }
        }

        let finished_at = self.clock.now();
        let errors = report.errors.clone();
        self.update_config(store_id, |c| {
            if errors.is_empty() {
                c.last_successful_sync = Some(finished_at);
                c.last_error = None;
            } else {
                c.last_error = Some(errors.join("; "));
            }
        })?;

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            store_id = %store_id,
            batches = report.batches.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "Sync cycle finished"
        );
        Ok(report)
    }

    /// Claims the next push batch of a partition and exchanges it.
    fn push_batch(
        &self,
        config: &SyncConfiguration,
        rule: &SyncEntityRule,
    ) -> SyncResult<Option<BatchReport>> {
        let mut batch = SyncBatch::new(config.store_id, BatchDirection::Push, rule.entity_type.clone());
        let items = self.queue.dequeue_batch(
            config.store_id,
            BatchDirection::Push,
            &rule.entity_type,
            config.effective_batch_size() as usize,
            batch.id,
        )?;
        if items.is_empty() {
            return Ok(None);
        }

        for item in &items {
            batch.push_record(SyncRecord::from_queue_item(item));
        }
        batch.payload = encode_records(&batch)?;
        batch.start(self.clock.now())?;
        let mut batch = self.store.insert_batch(batch)?;
        self.log_batch_started(&batch)?;

        let started = Instant::now();
        let exchanged = self.exchange(config, &batch);

        let current = self.load_batch(batch.id)?;
        let cancelled = current.status == BatchStatus::Cancelling;

        match exchanged {
            Err(_) if cancelled => return self.finish_cancelled(current, started).map(Some),
            Err(err) => {
                warn!(
                    store_id = %config.store_id,
                    batch_id = %batch.id,
                    error = %err,
                    "Push batch failed"
                );
                let message = err.to_string();
                for item_id in batch.records.iter().filter_map(|r| r.queue_item_id) {
                    self.fail_item(item_id, &message, err.is_retryable())?;
                }
                batch.fail_unprocessed(&message, self.clock.now());
            }
            Ok(outcomes) => {
                for outcome in &outcomes {
                    let Some(index) = batch.pending_record_index(&outcome.entity_id) else {
                        debug!(
                            batch_id = %batch.id,
                            entity_id = %outcome.entity_id,
                            "Ignoring outcome for a settled or unknown record"
                        );
                        continue;
                    };
                    let Some(item_id) = batch.records[index].queue_item_id else {
                        continue;
                    };
                    if let Err(err) = self.settle_push(rule, &mut batch, index, item_id, outcome) {
                        warn!(
                            batch_id = %batch.id,
                            item_id = %item_id,
                            error = %err,
                            "Could not settle pushed record"
                        );
                        if batch.record_failure(index, err.to_string(), self.clock.now()) {
                            self.fail_item(item_id, &err.to_string(), err.is_retryable())?;
                        }
                    }
                }

                if cancelled {
                    // Confirmed records stay settled; the rest go back to
                    // the queue.
                    batch.status = current.status;
                    batch.version = current.version;
                    return self.finish_cancelled(batch, started).map(Some);
                }

                let unanswered: Vec<(usize, Option<Uuid>)> = batch
                    .records
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| !r.processed)
                    .map(|(i, r)| (i, r.queue_item_id))
                    .collect();
                for (index, item_id) in unanswered {
                    batch.record_failure(index, "no outcome returned", self.clock.now());
                    if let Some(item_id) = item_id {
                        self.fail_item(item_id, "no outcome returned", true)?;
                    }
                }
            }
        }

        self.complete_batch(batch, started).map(Some)
    }

    /// Settles one pushed record from its remote outcome.
    fn settle_push(
        &self,
        rule: &SyncEntityRule,
        batch: &mut SyncBatch,
        index: usize,
        item_id: Uuid,
        outcome: &RecordOutcome,
    ) -> SyncResult<()> {
        match (outcome.remote_timestamp, outcome.remote_payload.is_some()) {
            (Some(remote_ts), true) => {
                let incoming = Incoming::new(outcome.remote_state(), remote_ts)
                    .with_base(outcome.remote_base_timestamp);
                self.apply_incoming(rule, batch, index, incoming, Some(item_id))
            }
            _ if outcome.success => {
                let item = self.load_item(item_id)?;
                self.mark_synced(&item.key(), item.entity_timestamp)?;
                self.complete_item(item_id)?;
                batch.record_success(index, self.clock.now());
                Ok(())
            }
            _ => {
                let error = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "rejected by remote".to_string());
                batch.record_failure(index, &error, self.clock.now());
                self.fail_item(item_id, &error, true)
            }
        }
    }

    /// Requests remote changes for a partition and applies them.
    fn pull_batch(
        &self,
        config: &SyncConfiguration,
        rule: &SyncEntityRule,
    ) -> SyncResult<Option<BatchReport>> {
        let mut batch = SyncBatch::new(config.store_id, BatchDirection::Pull, rule.entity_type.clone());
        batch.start(self.clock.now())?;

        let started = Instant::now();
        let outcomes = match self.exchange(config, &batch) {
            Ok(outcomes) => outcomes,
            Err(err) => {
                warn!(
                    store_id = %config.store_id,
                    entity_type = %rule.entity_type,
                    error = %err,
                    "Pull failed"
                );
                batch.error = Some(err.to_string());
                batch.transition(BatchStatus::Failed)?;
                batch.completed_at = Some(self.clock.now());
                let batch = self.store.insert_batch(batch)?;
                self.log_batch_finished(&batch, started)?;
                return Ok(Some(BatchReport::from(&batch)));
            }
        };
        if outcomes.is_empty() {
            return Ok(None);
        }

        // A snapshot delivered twice in one answer is applied once.
        let received = outcomes.len();
        let mut seen = HashSet::new();
        let outcomes: Vec<RecordOutcome> = outcomes
            .into_iter()
            .filter(|o| {
                seen.insert((
                    o.entity_id.clone(),
                    o.remote_timestamp,
                    o.remote_payload.clone(),
                    o.deleted,
                ))
            })
            .collect();
        if outcomes.len() < received {
            debug!(
                store_id = %config.store_id,
                entity_type = %rule.entity_type,
                duplicates = received - outcomes.len(),
                "Dropped duplicate incoming records"
            );
        }

        let fallback_ts = self.clock.now();
        for outcome in &outcomes {
            let operation = if outcome.deleted {
                OperationType::Delete
            } else {
                OperationType::Update
            };
            batch.push_record(
                SyncRecord::new(
                    outcome.entity_id.clone(),
                    operation,
                    outcome.remote_payload.clone().unwrap_or_default(),
                    outcome.remote_timestamp.unwrap_or(fallback_ts),
                )
                .with_base_timestamp(outcome.remote_base_timestamp),
            );
        }
        batch.payload = encode_records(&batch)?;
        let mut batch = self.store.insert_batch(batch)?;
        self.log_batch_started(&batch)?;

        for (index, outcome) in outcomes.iter().enumerate() {
            if !outcome.success {
                let error = outcome.error.clone().unwrap_or_else(|| "remote error".into());
                batch.record_failure(index, error, self.clock.now());
                continue;
            }
            let record = batch.records[index].clone();
            let data = (!record.operation.is_delete()).then_some(record.data.as_slice());
            let incoming =
                Incoming::new(data, record.entity_timestamp).with_base(record.base_timestamp);
            if let Err(err) = self.apply_incoming(rule, &mut batch, index, incoming, None) {
                warn!(
                    batch_id = %batch.id,
                    entity_id = %record.entity_id,
                    error = %err,
                    "Could not apply incoming record"
                );
                batch.record_failure(index, err.to_string(), self.clock.now());
            }
        }

        self.complete_batch(batch, started).map(Some)
    }

    /// Classifies an incoming snapshot and applies, skips or raises a
    /// conflict for it. `item_id` is the pushed item the snapshot answers.
    fn apply_incoming(
        &self,
        rule: &SyncEntityRule,
        batch: &mut SyncBatch,
        index: usize,
        incoming: Incoming<'_>,
        item_id: Option<Uuid>,
    ) -> SyncResult<()> {
        let key = EntityKey::new(batch.entity_type.clone(), batch.records[index].entity_id.clone());
        let adapter = self.registry.adapter(&key.entity_type)?;
        if let Some(data) = incoming.data {
            adapter
                .validate(data)
                .map_err(|e| SyncError::Validation(format!("incoming {key} does not decode: {e}")))?;
        }

        let local = self.entities.get(&key)?;
        let open = self.queue.has_open_change(batch.store_id, &key, item_id)?;
        match classify(local.as_ref(), &incoming, open, adapter) {
            Classification::CleanApply => {
                self.write_local(
                    &key,
                    incoming.data.map(<[u8]>::to_vec),
                    incoming.timestamp,
                    Some(incoming.timestamp),
                )?;
                if let Some(item_id) = item_id {
                    self.complete_item(item_id)?;
                }
                batch.record_success(index, self.clock.now());
            }
            Classification::NoOp => {
                self.mark_synced(&key, incoming.timestamp)?;
                if let Some(item_id) = item_id {
                    self.complete_item(item_id)?;
                }
                batch.record_success(index, self.clock.now());
            }
            Classification::Conflict => {
                let local = local.ok_or_else(|| {
                    SyncError::InvariantViolation(format!("conflict on {key} without local state"))
                })?;
                let now = self.clock.now();
                let conflict = SyncConflict::new(
                    batch.store_id,
                    key,
                    batch.direction,
                    local.data,
                    local.last_modified,
                    incoming.data.map(<[u8]>::to_vec),
                    incoming.timestamp,
                    now,
                )
                .with_origin(Some(batch.id), item_id);
                let conflict = self.raise_conflict(rule, conflict)?;
                if let Some(item_id) = item_id {
                    self.update_item(item_id, |item| Ok(item.transition(QueueItemStatus::Conflicted)?))?;
                }
                batch.record_conflict(index, conflict.id, now);
                let conflict = self.auto_resolve(rule, conflict)?;
                if !conflict.is_resolved() {
                    self.park_open_items(&conflict)?;
                }
            }
        }
        Ok(())
    }

    /// Exchanges a batch and enforces the transport timeout.
    fn exchange(&self, config: &SyncConfiguration, batch: &SyncBatch) -> SyncResult<Vec<RecordOutcome>> {
        let timeout = config.transport_timeout();
        let started = Instant::now();
        let outcomes = self.transport.send(batch, timeout)?;
        let elapsed = started.elapsed();
        if elapsed > timeout {
            return Err(SyncError::Timeout(elapsed));
        }
        Ok(outcomes)
    }

    /// Records a failed attempt: back to `pending` with backoff, or
    /// `failed` for good once the ceiling is reached or the error is
    /// permanent.
    pub(crate) fn fail_item(&self, item_id: Uuid, error: &str, retryable: bool) -> SyncResult<()> {
        let now = self.clock.now();
        let item = self.load_item(item_id)?;
        if item.status != QueueItemStatus::Processing {
            debug!(item_id = %item_id, status = ?item.status, "Item already settled, not failing it");
            return Ok(());
        }
        let config = self.load_config(item.store_id)?;
        let policy = RetryPolicy {
            max_attempts: item.max_attempts,
            ..RetryPolicy::from_config(&config)
        };

        let item = self.update_item(item_id, |item| {
            item.attempts += 1;
            item.last_error = Some(error.to_string());
            match policy.next_step(item.attempts, now) {
                RetryStep::RetryAt(at) if retryable => {
                    item.next_retry_at = Some(at);
                    item.transition(QueueItemStatus::Pending)?;
                }
                _ => {
                    item.next_retry_at = None;
                    item.transition(QueueItemStatus::Failed)?;
                }
            }
            Ok(())
        })?;

        let entry = if item.status == QueueItemStatus::Pending {
            let retry_at = item.next_retry_at.unwrap_or(now);
            SyncLogEntry::new(
                item.store_id,
                LogEvent::QueueItemRetried,
                format!(
                    "attempt {} of {} failed ({error}); retrying at {retry_at}",
                    item.attempts, item.max_attempts
                ),
                now,
            )
            .with_success(false)
        } else {
            let terminal = SyncError::TerminalFailure {
                item_id,
                attempts: item.attempts,
                last_error: error.to_string(),
            };
            SyncLogEntry::new(item.store_id, LogEvent::QueueItemFailed, terminal.to_string(), now)
                .alerting()
        };
        let entry = entry
            .with_entity_type(&item.entity_type)
            .with_queue_item(item.id);
        let entry = match item.batch_id {
            Some(batch_id) => entry.with_batch(batch_id),
            None => entry,
        };
        self.log.record(entry)
    }

    /// Moves an item to `completed`.
    pub(crate) fn complete_item(&self, item_id: Uuid) -> SyncResult<SyncQueueItem> {
        self.update_item(item_id, |item| {
            item.next_retry_at = None;
            Ok(item.transition(QueueItemStatus::Completed)?)
        })
    }

    /// Reverts an in-flight item to `pending` without consuming an attempt.
    pub(crate) fn release_item(&self, item_id: Uuid) -> SyncResult<SyncQueueItem> {
        self.update_item(item_id, |item| Ok(item.transition(QueueItemStatus::Pending)?))
    }

    /// Read-modify-write of one queue item at its current version.
    pub(crate) fn update_item(
        &self,
        item_id: Uuid,
        edit: impl FnOnce(&mut SyncQueueItem) -> SyncResult<()>,
    ) -> SyncResult<SyncQueueItem> {
        let mut item = self.load_item(item_id)?;
        let expected = item.version;
        edit(&mut item)?;
        Ok(self.store.update_queue_item(item, expected)?)
    }

    /// Settles a batch's final status and persists it.
    fn complete_batch(&self, mut batch: SyncBatch, started: Instant) -> SyncResult<BatchReport> {
        let now = self.clock.now();
        if !batch.status.is_finished() {
            batch.finish(now)?;
        }
        batch.check_invariants()?;

        let expected = batch.version;
        let batch = match self.store.update_batch(batch.clone(), expected) {
            Ok(stored) => stored,
            Err(err) if err.is_version_conflict() => {
                // Cancelled after the outcomes arrived: every record is
                // settled, so only the final status changes.
                let current = self.load_batch(batch.id)?;
                if current.status != BatchStatus::Cancelling {
                    return Err(err.into());
                }
                let mut settled = batch;
                settled.status = BatchStatus::Cancelling;
                settled.transition(BatchStatus::Cancelled)?;
                settled.completed_at = Some(now);
                self.store.update_batch(settled, current.version)?
            }
            Err(err) => return Err(err.into()),
        };
        self.log_batch_finished(&batch, started)?;
        Ok(BatchReport::from(&batch))
    }

    /// Ends a batch that was cancelled while in flight.
    pub(crate) fn finish_cancelled(&self, mut batch: SyncBatch, started: Instant) -> SyncResult<BatchReport> {
        let unconfirmed: Vec<Uuid> = batch.unconfirmed().filter_map(|r| r.queue_item_id).collect();
        for item_id in &unconfirmed {
            if self.load_item(*item_id)?.status == QueueItemStatus::Processing {
                self.release_item(*item_id)?;
            }
        }

        let now = self.clock.now();
        let expected = batch.version;
        if batch.status == BatchStatus::InProgress {
            batch.transition(BatchStatus::Cancelling)?;
        }
        batch.transition(BatchStatus::Cancelled)?;
        batch.completed_at = Some(now);
        let batch = self.store.update_batch(batch, expected)?;

        self.log.record(
            SyncLogEntry::new(
                batch.store_id,
                LogEvent::BatchCancelled,
                format!(
                    "{} batch cancelled; {} item(s) returned to the queue",
                    batch.direction,
                    unconfirmed.len()
                ),
                now,
            )
            .with_entity_type(&batch.entity_type)
            .with_batch(batch.id)
            .with_duration(started.elapsed()),
        )?;
        Ok(BatchReport::from(&batch))
    }

    fn log_batch_started(&self, batch: &SyncBatch) -> SyncResult<()> {
        self.log.record(
            SyncLogEntry::new(
                batch.store_id,
                LogEvent::BatchStarted,
                format!("{} batch of {} record(s)", batch.direction, batch.record_count),
                self.clock.now(),
            )
            .with_entity_type(&batch.entity_type)
            .with_batch(batch.id),
        )
    }

    fn log_batch_finished(&self, batch: &SyncBatch, started: Instant) -> SyncResult<()> {
        let mut message = format!(
            "{} batch {:?}: {} ok, {} failed, {} conflicted",
            batch.direction,
            batch.status,
            batch.success_count,
            batch.failed_count,
            batch.conflict_count
        );
        if let Some(error) = &batch.error {
            message.push_str(&format!(" ({error})"));
        }
        self.log.record(
            SyncLogEntry::new(batch.store_id, LogEvent::BatchCompleted, message, self.clock.now())
                .with_entity_type(&batch.entity_type)
                .with_batch(batch.id)
                .with_success(batch.status == BatchStatus::Completed)
                .with_duration(started.elapsed()),
        )
    }

    /// Writes the local copy of an entity at its current version.
    pub(crate) fn write_local(
        &self,
        key: &EntityKey,
        data: Option<Vec<u8>>,
        last_modified: DateTime<Utc>,
        synced_at: Option<DateTime<Utc>>,
    ) -> SyncResult<LocalRecord> {
        let expected = self.entities.get(key)?.map_or(0, |r| r.version);
        let record = LocalRecord {
            key: key.clone(),
            data,
            last_modified,
            synced_at,
            version: expected,
        };
        Ok(self.entities.put(record, expected)?)
    }

    /// Advances the local record's synced timestamp to `at`.
    fn mark_synced(&self, key: &EntityKey, at: DateTime<Utc>) -> SyncResult<()> {
        if let Some(mut record) = self.entities.get(key)? {
            if record.synced_at.map_or(true, |s| s < at) {
                let expected = record.version;
                record.synced_at = Some(at);
                self.entities.put(record, expected)?;
            }
        }
        Ok(())
    }

    pub(crate) fn load_config(&self, store_id: StoreId) -> SyncResult<SyncConfiguration> {
        self.store
            .configuration(store_id)?
            .ok_or_else(|| SyncError::not_found("configuration", store_id))
    }

    /// Read-modify-write of a configuration, retried on concurrent updates.
    pub(crate) fn update_config(
        &self,
        store_id: StoreId,
        edit: impl Fn(&mut SyncConfiguration),
    ) -> SyncResult<SyncConfiguration> {
        let mut attempts = 0;
        loop {
            let mut config = self.load_config(store_id)?;
            let expected = config.version;
            edit(&mut config);
            match self.store.update_configuration(config, expected) {
                Ok(updated) => return Ok(updated),
                Err(err) if err.is_version_conflict() && attempts < 3 => attempts += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(crate) fn load_item(&self, item_id: Uuid) -> SyncResult<SyncQueueItem> {
        self.store
            .queue_item(item_id)?
            .ok_or_else(|| SyncError::not_found("queue item", item_id))
    }

    pub(crate) fn load_batch(&self, batch_id: Uuid) -> SyncResult<SyncBatch> {
        self.store
            .batch(batch_id)?
            .ok_or_else(|| SyncError::not_found("batch", batch_id))
    }

    /// Timeout the transport gets for `store_id`.
    pub fn transport_timeout(&self, store_id: StoreId) -> SyncResult<Duration> {
        Ok(self.load_config(store_id)?.transport_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::JsonAdapter;
    use crate::transport::{MockReply, MockTransport};
    use chrono::TimeZone;
    use storesync_protocol::{ConflictPolicy, SyncDirection};
    use storesync_storage::{InMemoryEntityStore, InMemoryStore};

    struct Node {
        engine: SyncEngine<MockTransport>,
        store: Arc<InMemoryStore>,
        entities: Arc<InMemoryEntityStore>,
        store_id: StoreId,
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn node(config: SyncConfiguration, rule: SyncEntityRule) -> Node {
        let store = Arc::new(InMemoryStore::new());
        let entities = Arc::new(InMemoryEntityStore::new());
        let clock = Arc::new(ManualClock::new(ts(1_000)));
        let store_id = config.store_id;
        store.insert_configuration(config).unwrap();
        store.insert_rule(rule).unwrap();
        let engine = SyncEngine::new(
            store.clone(),
            entities.clone(),
            MockTransport::new(),
            EntityRegistry::new().with("product", JsonAdapter),
        )
        .with_clock(clock);
        Node {
            engine,
            store,
            entities,
            store_id,
        }
    }

    fn default_node(direction: SyncDirection) -> Node {
        let store_id = StoreId::new();
        node(
            SyncConfiguration::new(store_id),
            SyncEntityRule::new(store_id, "product", direction),
        )
    }

    fn put(n: &Node, id: &str, body: &str) -> SyncQueueItem {
        n.engine
            .record_change(
                n.store_id,
                EntityKey::new("product", id),
                OperationType::Update,
                body.as_bytes().to_vec(),
                0,
            )
            .unwrap()
    }

    #[test]
    fn empty_cycle_is_noop() {
        let n = default_node(SyncDirection::Bidirectional);
        let report = n.engine.run_cycle(n.store_id).unwrap();
        assert!(report.is_noop());
        assert!(report.is_success());

        let config = n.store.configuration(n.store_id).unwrap().unwrap();
        assert_eq!(config.last_attempted_sync, Some(ts(1_000)));
        assert_eq!(config.last_successful_sync, Some(ts(1_000)));
        assert!(n.store.batches(n.store_id).unwrap().is_empty());
    }

    #[test]
    fn accepted_push_completes_items() {
        let n = default_node(SyncDirection::PushOnly);
        let item = put(&n, "p-1", r#"{"price":100}"#);

        let report = n.engine.run_cycle(n.store_id).unwrap();
        assert_eq!(report.batches.len(), 1);
        assert_eq!(report.batches[0].status, BatchStatus::Completed);
        assert_eq!(report.batches[0].succeeded, 1);

        let item = n.store.queue_item(item.id).unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Completed);
        let local = n.entities.get(&item.key()).unwrap().unwrap();
        assert_eq!(local.synced_at, Some(item.entity_timestamp));
    }

    #[test]
    fn pull_runs_before_push() {
        let n = default_node(SyncDirection::Bidirectional);
        put(&n, "p-1", r#"{"price":100}"#);
        n.engine
            .transport()
            .reply_to_pull(MockReply::Outcomes(vec![RecordOutcome::incoming(
                "p-2",
                br#"{"price":5}"#.to_vec(),
                ts(900),
            )]));

        n.engine.run_cycle(n.store_id).unwrap();
        let directions: Vec<_> = n.engine.transport().sent().iter().map(|b| b.direction).collect();
        assert_eq!(directions, [BatchDirection::Pull, BatchDirection::Push]);
        assert!(n
            .entities
            .get(&EntityKey::new("product", "p-2"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn transport_failure_schedules_retry() {
        let store_id = StoreId::new();
        let n = node(
            SyncConfiguration::new(store_id)
                .with_retry_attempts(2)
                .with_retry_delay_secs(5),
            SyncEntityRule::new(store_id, "product", SyncDirection::PushOnly),
        );
        let item = put(&n, "p-1", r#"{"price":100}"#);
        n.engine.transport().reply_to_push(MockReply::Failure {
            message: "hub unavailable".into(),
            retryable: true,
        });

        let report = n.engine.run_cycle(n.store_id).unwrap();
        assert_eq!(report.batches[0].status, BatchStatus::Failed);
        assert!(!report.is_success());

        let item = n.store.queue_item(item.id).unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.next_retry_at, Some(ts(1_005)));

        let config = n.store.configuration(n.store_id).unwrap().unwrap();
        assert!(config.last_error.unwrap().contains("hub unavailable"));
        assert_eq!(config.last_successful_sync, None);
    }

    #[test]
    fn permanent_failure_is_terminal_and_alerts() {
        let n = default_node(SyncDirection::PushOnly);
        let item = put(&n, "p-1", r#"{"price":100}"#);
        n.engine.transport().reply_to_push(MockReply::Failure {
            message: "schema rejected".into(),
            retryable: false,
        });

        n.engine.run_cycle(n.store_id).unwrap();
        let item = n.store.queue_item(item.id).unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Failed);

        let alerts: Vec<_> = n
            .store
            .log_entries(n.store_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.alert)
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event, LogEvent::QueueItemFailed);
    }

    #[test]
    fn timeout_is_a_transient_batch_failure() {
        let store_id = StoreId::new();
        let n = node(
            SyncConfiguration::new(store_id).with_transport_timeout_secs(0),
            SyncEntityRule::new(store_id, "product", SyncDirection::PushOnly),
        );
        n.engine.transport().set_latency(Duration::from_millis(5));
        let item = put(&n, "p-1", r#"{"price":100}"#);

        let report = n.engine.run_cycle(n.store_id).unwrap();
        assert_eq!(report.batches[0].status, BatchStatus::Failed);
        assert!(report.batches[0].error.as_deref().unwrap().contains("timed out"));
        let item = n.store.queue_item(item.id).unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn mixed_outcomes_finish_partial() {
        let n = default_node(SyncDirection::PushOnly);
        let ok = put(&n, "p-1", r#"{"price":1}"#);
        let bad = put(&n, "p-2", r#"{"price":2}"#);
        n.engine.transport().reply_to_push(MockReply::Outcomes(vec![
            RecordOutcome::accepted("p-1"),
            RecordOutcome::rejected("p-2", "locked"),
        ]));

        let report = n.engine.run_cycle(n.store_id).unwrap();
        assert_eq!(report.batches[0].status, BatchStatus::Partial);
        assert_eq!(
            n.store.queue_item(ok.id).unwrap().unwrap().status,
            QueueItemStatus::Completed
        );
        let bad = n.store.queue_item(bad.id).unwrap().unwrap();
        assert_eq!(bad.status, QueueItemStatus::Pending);
        assert_eq!(bad.last_error.as_deref(), Some("locked"));
    }

    #[test]
    fn duplicate_outcomes_count_once() {
        let n = default_node(SyncDirection::PushOnly);
        put(&n, "p-1", r#"{"price":1}"#);
        n.engine.transport().reply_to_push(MockReply::Outcomes(vec![
            RecordOutcome::accepted("p-1"),
            RecordOutcome::accepted("p-1"),
        ]));

        let report = n.engine.run_cycle(n.store_id).unwrap();
        assert_eq!(report.batches[0].succeeded, 1);
        assert_eq!(report.batches[0].records, 1);
        let batch = n.store.batch(report.batches[0].batch_id).unwrap().unwrap();
        batch.check_invariants().unwrap();
    }

    #[test]
    fn missing_outcome_is_retried() {
        let n = default_node(SyncDirection::PushOnly);
        let item = put(&n, "p-1", r#"{"price":1}"#);
        n.engine.transport().reply_to_push(MockReply::Outcomes(Vec::new()));

        n.engine.run_cycle(n.store_id).unwrap();
        let item = n.store.queue_item(item.id).unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.last_error.as_deref(), Some("no outcome returned"));
    }

    #[test]
    fn paused_store_does_nothing() {
        let store_id = StoreId::new();
        let n = node(
            SyncConfiguration::new(store_id).with_enabled(false),
            SyncEntityRule::new(store_id, "product", SyncDirection::Bidirectional),
        );
        let report = n.engine.run_cycle(n.store_id).unwrap();
        assert!(report.paused);
        assert!(n.engine.transport().sent().is_empty());
    }

    #[test]
    fn remote_newer_pull_overwrites_local() {
        let store_id = StoreId::new();
        let n = node(
            SyncConfiguration::new(store_id),
            SyncEntityRule::new(store_id, "product", SyncDirection::PullOnly)
                .with_policy(ConflictPolicy::ManualReview),
        );
        n.engine
            .write_local(
                &EntityKey::new("product", "p-1"),
                Some(br#"{"price":1}"#.to_vec()),
                ts(100),
                Some(ts(100)),
            )
            .unwrap();
        n.engine
            .transport()
            .reply_to_pull(MockReply::Outcomes(vec![RecordOutcome::incoming(
                "p-1",
                br#"{"price":2}"#.to_vec(),
                ts(200),
            )]));

        let report = n.engine.run_cycle(n.store_id).unwrap();
        assert_eq!(report.batches[0].succeeded, 1);
        let local = n.entities.get(&EntityKey::new("product", "p-1")).unwrap().unwrap();
        assert_eq!(local.data.as_deref(), Some(br#"{"price":2}"#.as_slice()));
        assert_eq!(local.last_modified, ts(200));
        assert_eq!(local.synced_at, Some(ts(200)));
    }

    #[test]
    fn pulled_tombstone_deletes_local() {
        let n = default_node(SyncDirection::PullOnly);
        n.engine
            .write_local(
                &EntityKey::new("product", "p-1"),
                Some(br#"{"price":1}"#.to_vec()),
                ts(100),
                Some(ts(100)),
            )
            .unwrap();
        n.engine.transport().reply_to_pull(MockReply::Outcomes(vec![
            RecordOutcome::incoming("p-1", br#"{"price":1}"#.to_vec(), ts(300)).as_tombstone(),
        ]));

        n.engine.run_cycle(n.store_id).unwrap();
        let local = n.entities.get(&EntityKey::new("product", "p-1")).unwrap().unwrap();
        assert!(local.is_deleted());
        assert_eq!(local.last_modified, ts(300));
    }
}
