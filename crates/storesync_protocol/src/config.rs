//! Per-store sync configuration and per-entity-type rules.

use crate::batch::BatchDirection;
use crate::conflict::ConflictPolicy;
use crate::ids::{EntityType, StoreId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Sync configuration for one store.
///
/// Created when a store is provisioned and never deleted; an operator
/// soft-disables a store by clearing `enabled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    /// Store this configuration belongs to.
    pub store_id: StoreId,
    /// Seconds between scheduled sync cycles.
    pub sync_interval_secs: u64,
    /// Whether sync runs at all for this store.
    pub enabled: bool,
    /// Whether the scheduler starts this store on boot.
    pub auto_start: bool,
    /// Maximum number of records per batch.
    pub max_batch_size: u32,
    /// Attempt ceiling for a queue item.
    pub retry_attempts: u32,
    /// Base retry delay in seconds.
    pub retry_delay_secs: u64,
    /// Cap for the exponential backoff delay in seconds.
    pub max_retry_delay_secs: u64,
    /// Transport exchange timeout in seconds.
    pub transport_timeout_secs: u64,
    /// Completion time of the last cycle with no failed batch.
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Start time of the last cycle.
    pub last_attempted_sync: Option<DateTime<Utc>>,
    /// Error text from the last failed cycle.
    pub last_error: Option<String>,
    /// Row version for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

impl SyncConfiguration {
    /// Creates a configuration with default tuning.
    pub fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            sync_interval_secs: 300,
            enabled: true,
            auto_start: true,
            max_batch_size: 100,
            retry_attempts: 3,
            retry_delay_secs: 30,
            max_retry_delay_secs: 3600,
            transport_timeout_secs: 30,
            last_successful_sync: None,
            last_attempted_sync: None,
            last_error: None,
            version: 0,
        }
    }

    /// Sets the sync interval.
    pub fn with_sync_interval_secs(mut self, secs: u64) -> Self {
        self.sync_interval_secs = secs;
        self
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch_size(mut self, size: u32) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the retry attempt ceiling.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the base retry delay.
    pub fn with_retry_delay_secs(mut self, secs: u64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    /// Sets the backoff cap.
    pub fn with_max_retry_delay_secs(mut self, secs: u64) -> Self {
        self.max_retry_delay_secs = secs;
        self
    }

    /// Sets the transport timeout.
    pub fn with_transport_timeout_secs(mut self, secs: u64) -> Self {
        self.transport_timeout_secs = secs;
        self
    }

    /// Sets whether the scheduler starts this store on boot.
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Sets the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns the sync interval as a duration (never zero).
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    /// Returns the transport timeout as a duration.
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }

    /// Batch size clamped to at least one record.
    pub fn effective_batch_size(&self) -> u32 {
        self.max_batch_size.max(1)
    }
}

/// Which way an entity type flows between a store and the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Local changes are pushed; remote changes are never pulled.
    PushOnly,
    /// Remote changes are pulled; local changes are never pushed.
    PullOnly,
    /// Both.
    Bidirectional,
}

impl SyncDirection {
    /// Returns true if batches in `direction` are allowed.
    pub fn allows(&self, direction: BatchDirection) -> bool {
        match self {
            SyncDirection::PushOnly => direction == BatchDirection::Push,
            SyncDirection::PullOnly => direction == BatchDirection::Pull,
            SyncDirection::Bidirectional => true,
        }
    }

    /// Batch directions for one cycle. Pull always happens before push.
    pub fn batch_directions(&self) -> &'static [BatchDirection] {
        match self {
            SyncDirection::PushOnly => &[BatchDirection::Push],
            SyncDirection::PullOnly => &[BatchDirection::Pull],
            SyncDirection::Bidirectional => &[BatchDirection::Pull, BatchDirection::Push],
        }
    }
}

/// Sync behavior for one entity type within a store's configuration.
///
/// At most one rule exists per (store, entity type); storage rejects
/// duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntityRule {
    /// Rule id.
    pub id: Uuid,
    /// Owning configuration.
    pub store_id: StoreId,
    /// Entity type this rule governs.
    pub entity_type: EntityType,
    /// Flow direction.
    pub direction: SyncDirection,
    /// Conflict policy.
    pub conflict_policy: ConflictPolicy,
    /// Forces manual review regardless of `conflict_policy`.
    pub flag_for_review: bool,
    /// Higher weights are batched first within a cycle.
    pub priority: i32,
    /// Disabled rules are skipped by the batcher and reject enqueues.
    pub enabled: bool,
    /// Row version for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
}

impl SyncEntityRule {
    /// Creates an enabled rule with `LatestTimestampWins` and priority 0.
    pub fn new(store_id: StoreId, entity_type: impl Into<EntityType>, direction: SyncDirection) -> Self {
        Self {
            id: Uuid::new_v4(),
            store_id,
            entity_type: entity_type.into(),
            direction,
            conflict_policy: ConflictPolicy::LatestTimestampWins,
            flag_for_review: false,
            priority: 0,
            enabled: true,
            version: 0,
        }
    }

    /// Sets the conflict policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the priority weight.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the manual review override.
    pub fn with_flag_for_review(mut self, flag: bool) -> Self {
        self.flag_for_review = flag;
        self
    }

    /// Sets the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The policy actually applied to conflicts of this entity type.
    pub fn effective_policy(&self) -> ConflictPolicy {
        if self.flag_for_review {
            ConflictPolicy::ManualReview
        } else {
            self.conflict_policy
        }
    }
}
