//! Scenario files.
//!
//! A scenario is a JSON document naming a set of stores, their sync
//! configuration and rules, and a list of steps to run against them.
//!
//! ```json
//! {
//!   "name": "price change race",
//!   "stores": [
//!     { "name": "downtown", "rules": [{ "entity_type": "product", "direction": "bidirectional" }] },
//!     { "name": "airport", "rules": [{ "entity_type": "product", "direction": "bidirectional" }] }
//!   ],
//!   "steps": [
//!     { "action": "edit", "store": "downtown", "entity_type": "product", "id": "p-1", "data": { "price": 10 } },
//!     { "action": "advance", "secs": 5 },
//!     { "action": "settle" }
//!   ]
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use storesync_engine::{ResolutionChoice, SyncError};
use storesync_protocol::{ConflictPolicy, StoreId, SyncConfiguration, SyncDirection, SyncEntityRule};
use storesync_storage::StorageError;
use thiserror::Error;

/// Errors raised while loading or running a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Scenario path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not a valid scenario.
    #[error("invalid scenario: {0}")]
    Parse(#[from] serde_json::Error),

    /// The scenario is well-formed but inconsistent.
    #[error("invalid scenario: {0}")]
    Invalid(String),

    /// A step names a store the scenario does not declare.
    #[error("step {step}: unknown store '{store}'")]
    UnknownStore {
        /// Step index, starting at 1.
        step: usize,
        /// Store name.
        store: String,
    },

    /// The engine rejected a step.
    #[error("step {step}: {source}")]
    Step {
        /// Step index, starting at 1.
        step: usize,
        /// Engine error.
        source: SyncError,
    },

    /// Setting up a store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Engine error outside any step.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Result type for scenario operations.
pub type ScenarioResult<T> = Result<T, ScenarioError>;

/// A scenario file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Clock value when the scenario starts.
    #[serde(default = "default_start")]
    pub start: DateTime<Utc>,
    /// Participating stores.
    pub stores: Vec<StoreEntry>,
    /// Steps, run in order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default()
}

/// One store of a scenario.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreEntry {
    /// Name used by steps.
    pub name: String,
    /// Tuning; unset fields keep the defaults.
    #[serde(default)]
    pub config: ConfigOverrides,
    /// Entity rules.
    pub rules: Vec<RuleEntry>,
}

/// Overrides for [`SyncConfiguration`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    /// Maximum records per batch.
    pub max_batch_size: Option<u32>,
    /// Attempt ceiling.
    pub retry_attempts: Option<u32>,
    /// Delay after the first failure.
    pub retry_delay_secs: Option<u64>,
    /// Backoff cap.
    pub max_retry_delay_secs: Option<u64>,
    /// Transport timeout.
    pub transport_timeout_secs: Option<u64>,
    /// Interval between scheduled cycles.
    pub sync_interval_secs: Option<u64>,
    /// Start paused when false.
    pub enabled: Option<bool>,
}

impl ConfigOverrides {
    /// Builds the configuration for `store_id`.
    pub fn build(&self, store_id: StoreId) -> SyncConfiguration {
        let mut config = SyncConfiguration::new(store_id);
        if let Some(size) = self.max_batch_size {
            config = config.with_max_batch_size(size);
        }
        if let Some(attempts) = self.retry_attempts {
            config = config.with_retry_attempts(attempts);
        }
        if let Some(secs) = self.retry_delay_secs {
            config = config.with_retry_delay_secs(secs);
        }
        if let Some(secs) = self.max_retry_delay_secs {
            config = config.with_max_retry_delay_secs(secs);
        }
        if let Some(secs) = self.transport_timeout_secs {
            config = config.with_transport_timeout_secs(secs);
        }
        if let Some(secs) = self.sync_interval_secs {
            config = config.with_sync_interval_secs(secs);
        }
        if let Some(enabled) = self.enabled {
            config = config.with_enabled(enabled);
        }
        config
    }
}

/// One entity rule of a store.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    /// Entity type.
    pub entity_type: String,
    /// Flow direction.
    pub direction: SyncDirection,
    /// Conflict policy; the rule default when unset.
    #[serde(default)]
    pub policy: Option<ConflictPolicy>,
    /// Processing priority.
    #[serde(default)]
    pub priority: i32,
    /// Route every conflict to manual review.
    #[serde(default)]
    pub flag_for_review: bool,
}

impl RuleEntry {
    /// Builds the rule for `store_id`.
    pub fn build(&self, store_id: StoreId) -> SyncEntityRule {
        let mut rule = SyncEntityRule::new(store_id, self.entity_type.as_str(), self.direction)
            .with_priority(self.priority)
            .with_flag_for_review(self.flag_for_review);
        if let Some(policy) = self.policy {
            rule = rule.with_policy(policy);
        }
        rule
    }
}

/// A scenario step.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    /// A store creates or updates an entity.
    Edit {
        /// Store name.
        store: String,
        /// Entity type.
        entity_type: String,
        /// Entity id.
        id: String,
        /// New state.
        data: serde_json::Value,
        /// Queue priority.
        #[serde(default)]
        priority: i32,
    },
    /// A store deletes an entity.
    Delete {
        /// Store name.
        store: String,
        /// Entity type.
        entity_type: String,
        /// Entity id.
        id: String,
    },
    /// Headquarters writes an entity directly; `null` data deletes it.
    HubEdit {
        /// Entity type.
        entity_type: String,
        /// Entity id.
        id: String,
        /// New state.
        data: Option<serde_json::Value>,
    },
    /// A store runs one cycle.
    Cycle {
        /// Store name.
        store: String,
    },
    /// Every store cycles until nothing moves.
    Settle {
        /// Round limit.
        #[serde(default = "default_rounds")]
        max_rounds: usize,
    },
    /// The clock moves forward.
    Advance {
        /// Seconds.
        secs: u32,
    },
    /// A store stops syncing.
    Pause {
        /// Store name.
        store: String,
    },
    /// A paused store syncs again.
    Resume {
        /// Store name.
        store: String,
    },
    /// An operator settles every open conflict of a store the same way.
    ResolveConflicts {
        /// Store name.
        store: String,
        /// Surviving state.
        choice: ResolutionChoice,
        /// Operator identity.
        #[serde(default = "default_operator")]
        resolved_by: String,
    },
}

fn default_rounds() -> usize {
    10
}

fn default_operator() -> String {
    "operator".to_string()
}

impl Step {
    /// Short name of the step's action.
    pub fn action(&self) -> &'static str {
        match self {
            Step::Edit { .. } => "edit",
            Step::Delete { .. } => "delete",
            Step::HubEdit { .. } => "hub_edit",
            Step::Cycle { .. } => "cycle",
            Step::Settle { .. } => "settle",
            Step::Advance { .. } => "advance",
            Step::Pause { .. } => "pause",
            Step::Resume { .. } => "resume",
            Step::ResolveConflicts { .. } => "resolve_conflicts",
        }
    }

    /// Store the step targets, if any.
    pub fn store(&self) -> Option<&str> {
        match self {
            Step::Edit { store, .. }
            | Step::Delete { store, .. }
            | Step::Cycle { store }
            | Step::Pause { store }
            | Step::Resume { store }
            | Step::ResolveConflicts { store, .. } => Some(store),
            Step::HubEdit { .. } | Step::Settle { .. } | Step::Advance { .. } => None,
        }
    }
}

impl Scenario {
    /// Reads and validates a scenario file.
    pub fn load(path: &Path) -> ScenarioResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses and validates a scenario document.
    pub fn parse(text: &str) -> ScenarioResult<Self> {
        let scenario: Scenario = serde_json::from_str(text)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Checks store names and step references.
    pub fn validate(&self) -> ScenarioResult<()> {
        if self.stores.is_empty() {
            return Err(ScenarioError::Invalid("no stores declared".into()));
        }

        let mut names = BTreeSet::new();
        for store in &self.stores {
            if !names.insert(store.name.as_str()) {
                return Err(ScenarioError::Invalid(format!(
                    "store '{}' declared twice",
                    store.name
                )));
            }
            let mut types = BTreeSet::new();
            for rule in &store.rules {
                if !types.insert(rule.entity_type.as_str()) {
                    return Err(ScenarioError::Invalid(format!(
                        "store '{}' has two rules for '{}'",
                        store.name, rule.entity_type
                    )));
                }
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            if let Some(store) = step.store() {
                if !names.contains(store) {
                    return Err(ScenarioError::UnknownStore {
                        step: index + 1,
                        store: store.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Every entity type named by a rule or a step.
    pub fn entity_types(&self) -> BTreeSet<String> {
        let rules = self
            .stores
            .iter()
            .flat_map(|s| s.rules.iter().map(|r| r.entity_type.clone()));
        let steps = self.steps.iter().filter_map(|step| match step {
            Step::Edit { entity_type, .. }
            | Step::Delete { entity_type, .. }
            | Step::HubEdit { entity_type, .. } => Some(entity_type.clone()),
            _ => None,
        });
        rules.chain(steps).collect()
    }
}
