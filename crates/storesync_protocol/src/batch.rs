//! Sync batches and the records they carry.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{EntityType, StoreId};
use crate::queue::{OperationType, SyncQueueItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a batch relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchDirection {
    /// Local changes sent to the remote node.
    Push,
    /// Remote changes fetched into the local node.
    Pull,
}

impl std::fmt::Display for BatchDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchDirection::Push => f.write_str("push"),
            BatchDirection::Pull => f.write_str("pull"),
        }
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created, not yet handed to the transport.
    Pending,
    /// Transport exchange or record resolution in progress.
    InProgress,
    /// Cancellation requested while in flight.
    Cancelling,
    /// Cancelled; unconfirmed records were returned to the queue.
    Cancelled,
    /// Every record resolved without failure.
    Completed,
    /// No record succeeded.
    Failed,
    /// Some records failed, others succeeded or conflicted.
    Partial,
}

impl BatchStatus {
    /// Returns true if moving to `next` is allowed.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Cancelling)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Partial)
                | (Cancelling, Cancelled)
        )
    }

    /// Returns true once the batch can no longer change status.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            BatchStatus::Cancelled | BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Partial
        )
    }
}

/// One entity's state as carried inside a batch.
///
/// `success` is only meaningful once `processed` is set; a record with
/// `processed == false && success == true` is invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Queue item this record was built from (push only).
    pub queue_item_id: Option<Uuid>,
    /// Entity id.
    pub entity_id: String,
    /// Mutation kind.
    pub operation: OperationType,
    /// Serialized entity data.
    pub data: Vec<u8>,
    /// Source-side modification time.
    pub entity_timestamp: DateTime<Utc>,
    /// Last remote state the source had seen.
    pub base_timestamp: Option<DateTime<Utc>>,
    /// Whether an outcome has been recorded.
    pub processed: bool,
    /// Whether that outcome was a success.
    pub success: bool,
    /// Conflict raised for this record, if any.
    pub conflict_id: Option<Uuid>,
    /// Failure text.
    pub error: Option<String>,
    /// When the outcome was recorded.
    pub processed_at: Option<DateTime<Utc>>,
}

impl SyncRecord {
    /// Creates an unprocessed record.
    pub fn new(
        entity_id: impl Into<String>,
        operation: OperationType,
        data: Vec<u8>,
        entity_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            queue_item_id: None,
            entity_id: entity_id.into(),
            operation,
            data,
            entity_timestamp,
            base_timestamp: None,
            processed: false,
            success: false,
            conflict_id: None,
            error: None,
            processed_at: None,
        }
    }

    /// Wraps a claimed queue item.
    pub fn from_queue_item(item: &SyncQueueItem) -> Self {
        Self {
            queue_item_id: Some(item.id),
            entity_id: item.entity_id.clone(),
            operation: item.operation,
            data: item.payload.clone(),
            entity_timestamp: item.entity_timestamp,
            base_timestamp: item.base_timestamp,
            processed: false,
            success: false,
            conflict_id: None,
            error: None,
            processed_at: None,
        }
    }

    /// Sets the base timestamp.
    pub fn with_base_timestamp(mut self, base: Option<DateTime<Utc>>) -> Self {
        self.base_timestamp = base;
        self
    }

    /// Verifies the processed/success pairing.
    pub fn check_invariant(&self) -> ProtocolResult<()> {
        if self.success && !self.processed {
            return Err(ProtocolError::Invariant(format!(
                "record {} is marked successful but was never processed",
                self.entity_id
            )));
        }
        Ok(())
    }
}

/// A bounded group of records exchanged in one transport call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Batch id.
    pub id: Uuid,
    /// Store the batch belongs to.
    pub store_id: StoreId,
    /// Push or pull.
    pub direction: BatchDirection,
    /// Entity type of every record.
    pub entity_type: EntityType,
    /// Number of records.
    pub record_count: u32,
    /// Records with an outcome.
    pub processed_count: u32,
    /// Successful records.
    pub success_count: u32,
    /// Failed records.
    pub failed_count: u32,
    /// Conflicted records.
    pub conflict_count: u32,
    /// Lifecycle status.
    pub status: BatchStatus,
    /// When the batch entered `InProgress`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the batch finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Batch-level failure text.
    pub error: Option<String>,
    /// Opaque transport payload.
    pub payload: Vec<u8>,
    /// Records owned by this batch.
    pub records: Vec<SyncRecord>,
    /// Row version for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

impl SyncBatch {
    /// Creates an empty pending batch.
    pub fn new(store_id: StoreId, direction: BatchDirection, entity_type: EntityType) -> Self {
        Self {
            id: Uuid::new_v4(),
            store_id,
            direction,
            entity_type,
            record_count: 0,
            processed_count: 0,
            success_count: 0,
            failed_count: 0,
            conflict_count: 0,
            status: BatchStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            payload: Vec::new(),
            records: Vec::new(),
            version: 0,
        }
    }

    /// Appends a record.
    pub fn push_record(&mut self, record: SyncRecord) {
        self.records.push(record);
        self.record_count = u32::try_from(self.records.len()).unwrap_or(u32::MAX);
    }

    /// Moves the batch to `next`, enforcing the lifecycle.
    pub fn transition(&mut self, next: BatchStatus) -> ProtocolResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ProtocolError::transition("batch", self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// Marks the batch in progress.
    pub fn start(&mut self, now: DateTime<Utc>) -> ProtocolResult<()> {
        self.transition(BatchStatus::InProgress)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Index of the first unprocessed record for `entity_id`.
    pub fn pending_record_index(&self, entity_id: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.entity_id == entity_id && !r.processed)
    }

    fn settle(&mut self, index: usize, now: DateTime<Utc>) -> Option<&mut SyncRecord> {
        let record = self.records.get_mut(index)?;
        if record.processed {
            return None;
        }
        record.processed = true;
        record.processed_at = Some(now);
        self.processed_count += 1;
        Some(record)
    }

    /// Records a success. Returns false if the record was already settled.
    pub fn record_success(&mut self, index: usize, now: DateTime<Utc>) -> bool {
        match self.settle(index, now) {
            Some(record) => {
                record.success = true;
                self.success_count += 1;
                true
            }
            None => false,
        }
    }

    /// Records a failure. Returns false if the record was already settled.
    pub fn record_failure(&mut self, index: usize, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        match self.settle(index, now) {
            Some(record) => {
                record.error = Some(error.into());
                self.failed_count += 1;
                true
            }
            None => false,
        }
    }

    /// Records a conflict. Returns false if the record was already settled.
    pub fn record_conflict(&mut self, index: usize, conflict_id: Uuid, now: DateTime<Utc>) -> bool {
        match self.settle(index, now) {
            Some(record) => {
                record.conflict_id = Some(conflict_id);
                self.conflict_count += 1;
                true
            }
            None => false,
        }
    }

    /// Fails every unprocessed record with `error`.
    pub fn fail_unprocessed(&mut self, error: &str, now: DateTime<Utc>) {
        for index in 0..self.records.len() {
            self.record_failure(index, error, now);
        }
        self.error = Some(error.to_string());
    }

    /// Records without an outcome.
    pub fn unconfirmed(&self) -> impl Iterator<Item = &SyncRecord> {
        self.records.iter().filter(|r| !r.processed)
    }

    /// Derives the final status from the counters and stamps completion.
    pub fn finish(&mut self, now: DateTime<Utc>) -> ProtocolResult<()> {
        let settled_ok = self.success_count + self.conflict_count;
        let next = if self.failed_count == 0 {
            BatchStatus::Completed
        } else if settled_ok == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        };
        self.transition(next)?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Checks the record invariants and counter consistency.
    pub fn check_invariants(&self) -> ProtocolResult<()> {
        for record in &self.records {
            record.check_invariant()?;
        }
        let processed = self.records.iter().filter(|r| r.processed).count();
        if u32::try_from(processed).ok() != Some(self.processed_count)
            || self.success_count + self.failed_count + self.conflict_count != self.processed_count
            || u32::try_from(self.records.len()).ok() != Some(self.record_count)
        {
            return Err(ProtocolError::Invariant(format!(
                "batch {} counters disagree with its records",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_with(n: usize) -> SyncBatch {
        let mut batch = SyncBatch::new(StoreId::new(), BatchDirection::Push, EntityType::new("product"));
        for i in 0..n {
            batch.push_record(SyncRecord::new(
                format!("p-{i}"),
                OperationType::Update,
                vec![i as u8],
                Utc::now(),
            ));
        }
        batch
    }

    #[test]
    fn duplicate_outcomes_are_not_double_counted() {
        let now = Utc::now();
        let mut batch = batch_with(1);
        batch.start(now).unwrap();

        assert!(batch.record_success(0, now));
        assert!(!batch.record_success(0, now));
        assert!(!batch.record_failure(0, "late failure", now));

        assert_eq!(batch.success_count, 1);
        assert_eq!(batch.failed_count, 0);
        assert_eq!(batch.processed_count, 1);
        batch.check_invariants().unwrap();
    }

    #[test]
    fn finish_derives_status() {
        let now = Utc::now();

        let mut all_ok = batch_with(2);
        all_ok.start(now).unwrap();
        all_ok.record_success(0, now);
        all_ok.record_conflict(1, Uuid::new_v4(), now);
        all_ok.finish(now).unwrap();
        assert_eq!(all_ok.status, BatchStatus::Completed);

        let mut mixed = batch_with(2);
        mixed.start(now).unwrap();
        mixed.record_success(0, now);
        mixed.record_failure(1, "rejected", now);
        mixed.finish(now).unwrap();
        assert_eq!(mixed.status, BatchStatus::Partial);

        let mut failed = batch_with(2);
        failed.start(now).unwrap();
        failed.fail_unprocessed("connection reset", now);
        failed.finish(now).unwrap();
        assert_eq!(failed.status, BatchStatus::Failed);
        assert_eq!(failed.failed_count, 2);
        assert_eq!(failed.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn empty_batch_completes() {
        let now = Utc::now();
        let mut batch = batch_with(0);
        batch.start(now).unwrap();
        batch.finish(now).unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert!(batch.completed_at.is_some());
    }

    #[test]
    fn success_without_processing_violates_invariant() {
        let mut record = SyncRecord::new("p-1", OperationType::Create, vec![], Utc::now());
        record.check_invariant().unwrap();

        record.success = true;
        assert!(matches!(
            record.check_invariant(),
            Err(ProtocolError::Invariant(_))
        ));
    }

    #[test]
    fn finished_batch_rejects_further_transitions() {
        let now = Utc::now();
        let mut batch = batch_with(0);
        batch.start(now).unwrap();
        batch.finish(now).unwrap();
        assert!(batch.transition(BatchStatus::InProgress).is_err());
        assert!(batch.status.is_finished());
    }

    #[test]
    fn pending_record_index_skips_settled_records() {
        let now = Utc::now();
        let mut batch = batch_with(0);
        batch.push_record(SyncRecord::new("dup", OperationType::Update, vec![1], now));
        batch.push_record(SyncRecord::new("dup", OperationType::Update, vec![2], now));

        assert_eq!(batch.pending_record_index("dup"), Some(0));
        batch.record_success(0, now);
        assert_eq!(batch.pending_record_index("dup"), Some(1));
        batch.record_success(1, now);
        assert_eq!(batch.pending_record_index("dup"), None);
    }

    #[test]
    fn record_count_tracks_pushed_records() {
        let now = Utc::now();
        let mut batch = batch_with(0);
        for i in 0..3u8 {
            batch.push_record(SyncRecord::new(format!("p-{i}"), OperationType::Update, vec![i], now));
        }
        assert_eq!(batch.record_count, 3);
        assert!(batch.check_invariants().is_ok());

        batch.record_count = 2;
        assert!(matches!(batch.check_invariants(), Err(ProtocolError::Invariant(_))));
    }
}
