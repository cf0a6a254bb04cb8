//! Run command implementation.

use crate::scenario::{Scenario, ScenarioError, ScenarioResult, Step};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use storesync_engine::{
    Clock, CycleReport, EntityRegistry, JsonAdapter, ManualClock, ManualResolution, StoreStatus,
    SyncEngine, SyncError, SyncResult,
};
use storesync_protocol::{
    BatchDirection, EntityKey, EntityType, OperationType, QueueItemStatus, StoreId, SyncEntityRule,
};
use storesync_storage::{
    EntityStore, InMemoryEntityStore, InMemoryStore, LocalRecord, QueueFilter, StorageResult,
    SyncStore,
};
use storesync_testkit::{HubRecord, LoopbackHub};
use tracing::{debug, info};

/// What a step did.
#[derive(Debug, Serialize)]
pub struct StepReport {
    /// Step index, starting at 1.
    pub step: usize,
    /// Step action.
    pub action: &'static str,
    /// Target store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    /// Cycles run by the step.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cycles: Vec<CycleReport>,
    /// Free-form outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One entity as a store or the hub holds it.
#[derive(Debug, Serialize)]
pub struct EntityView {
    /// `type/id`.
    pub key: String,
    /// Current state, `None` once deleted.
    pub data: Option<serde_json::Value>,
    /// Modification time.
    pub modified: DateTime<Utc>,
}

/// End state of one store.
#[derive(Debug, Serialize)]
pub struct StoreSummary {
    /// Store name.
    pub name: String,
    /// Sync health.
    pub status: StoreStatus,
    /// Local entities of every ruled type.
    pub entities: Vec<EntityView>,
}

/// Result of running a scenario.
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    /// Scenario name.
    pub name: Option<String>,
    /// Step outcomes.
    pub steps: Vec<StepReport>,
    /// Store end states.
    pub stores: Vec<StoreSummary>,
    /// Hub end state.
    pub hub: Vec<EntityView>,
    /// Entities a pulling store holds differently from the hub.
    pub divergence: Vec<String>,
}

struct Node {
    name: String,
    store_id: StoreId,
    engine: SyncEngine<Arc<LoopbackHub>>,
    store: Arc<InMemoryStore>,
    entities: Arc<InMemoryEntityStore>,
    rules: Vec<SyncEntityRule>,
}

impl Node {
    fn pulled_types(&self) -> impl Iterator<Item = &EntityType> {
        self.rules
            .iter()
            .filter(|r| r.enabled && r.direction.allows(BatchDirection::Pull))
            .map(|r| &r.entity_type)
    }

    fn is_idle(&self) -> StorageResult<bool> {
        let filter = QueueFilter::store(self.store_id)
            .statuses(&[QueueItemStatus::Pending, QueueItemStatus::Processing]);
        Ok(self.store.queue_items(&filter)?.is_empty())
    }
}

/// In-memory stores and hub driven by a scenario.
pub struct Harness {
    clock: Arc<ManualClock>,
    hub: Arc<LoopbackHub>,
    nodes: Vec<Node>,
}

fn registry(types: &BTreeSet<String>) -> EntityRegistry {
    types
        .iter()
        .fold(EntityRegistry::new(), |registry, t| registry.with(t.as_str(), JsonAdapter))
}

fn view(key: &EntityKey, data: Option<&[u8]>, modified: DateTime<Utc>) -> EntityView {
    EntityView {
        key: key.to_string(),
        data: data.map(|bytes| {
            serde_json::from_slice(bytes)
                .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }),
        modified,
    }
}

impl Harness {
    /// Creates the stores and hub a scenario declares.
    pub fn new(scenario: &Scenario) -> ScenarioResult<Self> {
        let types = scenario.entity_types();
        let clock = Arc::new(ManualClock::new(scenario.start));
        let hub = Arc::new(LoopbackHub::new(registry(&types)));

        let mut nodes = Vec::with_capacity(scenario.stores.len());
        for entry in &scenario.stores {
            let store_id = StoreId::new();
            let store = Arc::new(InMemoryStore::new());
            let entities = Arc::new(InMemoryEntityStore::new());
            store.insert_configuration(entry.config.build(store_id))?;
            let mut rules = Vec::with_capacity(entry.rules.len());
            for rule in &entry.rules {
                rules.push(store.insert_rule(rule.build(store_id))?);
            }

            let engine = SyncEngine::new(
                store.clone(),
                entities.clone(),
                Arc::clone(&hub),
                registry(&types),
            )
            .with_clock(clock.clone());
            debug!(store = %entry.name, %store_id, rules = rules.len(), "Created store");
            nodes.push(Node {
                name: entry.name.clone(),
                store_id,
                engine,
                store,
                entities,
                rules,
            });
        }

        Ok(Self { clock, hub, nodes })
    }

    fn node(&self, step: usize, name: &str) -> ScenarioResult<&Node> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| ScenarioError::UnknownStore {
                step,
                store: name.to_string(),
            })
    }

    /// Runs one step; `index` starts at 1.
    pub fn apply(&self, index: usize, step: &Step) -> ScenarioResult<StepReport> {
        let at = |source: SyncError| ScenarioError::Step { step: index, source };
        let mut report = StepReport {
            step: index,
            action: step.action(),
            store: step.store().map(str::to_string),
            cycles: Vec::new(),
            note: None,
        };

        match step {
            Step::Edit {
                store,
                entity_type,
                id,
                data,
                priority,
            } => {
                let node = self.node(index, store)?;
                let key = EntityKey::new(entity_type.as_str(), id.as_str());
                let exists = node.entities.get(&key)?.is_some_and(|r| !r.is_deleted());
                let operation = if exists {
                    OperationType::Update
                } else {
                    OperationType::Create
                };
                let payload = serde_json::to_vec(data)?;
                let item = node
                    .engine
                    .record_change(node.store_id, key, operation, payload, *priority)
                    .map_err(at)?;
                report.note = Some(format!("queued {:?} {}", item.operation, item.key()));
            }
            Step::Delete {
                store,
                entity_type,
                id,
            } => {
                let node = self.node(index, store)?;
                let key = EntityKey::new(entity_type.as_str(), id.as_str());
                let item = node
                    .engine
                    .record_change(node.store_id, key, OperationType::Delete, Vec::new(), 0)
                    .map_err(at)?;
                report.note = Some(format!("queued delete {}", item.key()));
            }
            Step::HubEdit {
                entity_type,
                id,
                data,
            } => {
                let key = EntityKey::new(entity_type.as_str(), id.as_str());
                let payload = data.as_ref().map(serde_json::to_vec).transpose()?;
                self.hub.edit(key.clone(), payload, self.clock.now());
                report.note = Some(format!("hub wrote {key}"));
            }
            Step::Cycle { store } => {
                let node = self.node(index, store)?;
                report.cycles.push(node.engine.run_cycle(node.store_id).map_err(at)?);
            }
            Step::Settle { max_rounds } => {
                let (rounds, cycles) = self.settle(*max_rounds).map_err(at)?;
                report.cycles = cycles;
                report.note = Some(match rounds {
                    Some(rounds) => format!("settled after {rounds} rounds"),
                    None => format!("still busy after {max_rounds} rounds"),
                });
            }
            Step::Advance { secs } => {
                self.clock.advance(Duration::seconds(i64::from(*secs)));
                report.note = Some(format!("clock at {}", self.clock.now().to_rfc3339()));
            }
            Step::Pause { store } => {
                let node = self.node(index, store)?;
                node.engine.pause(node.store_id).map_err(at)?;
            }
            Step::Resume { store } => {
                let node = self.node(index, store)?;
                node.engine.resume(node.store_id).map_err(at)?;
            }
            Step::ResolveConflicts {
                store,
                choice,
                resolved_by,
            } => {
                let node = self.node(index, store)?;
                let open = node.engine.unresolved_conflicts(node.store_id).map_err(at)?;
                for conflict in &open {
                    node.engine
                        .resolve_conflict(ManualResolution {
                            conflict_id: conflict.id,
                            choice: choice.clone(),
                            resolved_by: resolved_by.clone(),
                            note: Some(format!("scenario step {index}")),
                        })
                        .map_err(at)?;
                }
                report.note = Some(format!("resolved {} conflicts", open.len()));
            }
        }

        Ok(report)
    }

    /// Cycles every store until a full round exchanges nothing and no
    /// store has queued work. Conflicts parked for review do not count
    /// as queued work.
    pub fn settle(&self, max_rounds: usize) -> SyncResult<(Option<usize>, Vec<CycleReport>)> {
        let mut cycles = Vec::new();
        for round in 1..=max_rounds {
            let mut quiet = true;
            for node in &self.nodes {
                let report = node.engine.run_cycle(node.store_id)?;
                quiet &= report.is_noop();
                if !report.is_noop() {
                    cycles.push(report);
                }
            }
            self.clock.advance(Duration::seconds(1));

            let mut idle = true;
            for node in &self.nodes {
                idle &= node.is_idle()?;
            }
            if quiet && idle {
                return Ok((Some(round), cycles));
            }
        }
        Ok((None, cycles))
    }

    /// Entities a pulling store holds differently from the hub.
    pub fn divergence(&self) -> ScenarioResult<Vec<String>> {
        let hub = self.hub.snapshot();
        let mut differences = Vec::new();

        for node in &self.nodes {
            for entity_type in node.pulled_types() {
                let local = node.entities.list(entity_type)?;
                let remote: Vec<&(EntityKey, HubRecord)> =
                    hub.iter().filter(|(k, _)| &k.entity_type == entity_type).collect();

                for (key, record) in &remote {
                    let same = match local.iter().find(|l| &l.key == key) {
                        Some(l) => same_state(node, l, record),
                        None => record.data.is_none(),
                    };
                    if !same {
                        differences.push(format!("{}: {key} differs from hub", node.name));
                    }
                }
                for l in &local {
                    if !l.is_deleted() && !remote.iter().any(|(k, _)| *k == l.key) {
                        differences.push(format!("{}: {} unknown to hub", node.name, l.key));
                    }
                }
            }
        }
        Ok(differences)
    }

    /// End state of every store.
    pub fn summaries(&self) -> ScenarioResult<Vec<StoreSummary>> {
        let mut summaries = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut entities = Vec::new();
            for rule in &node.rules {
                for record in node.entities.list(&rule.entity_type)? {
                    entities.push(view(&record.key, record.data.as_deref(), record.last_modified));
                }
            }
            summaries.push(StoreSummary {
                name: node.name.clone(),
                status: node.engine.status(node.store_id)?,
                entities,
            });
        }
        Ok(summaries)
    }

    /// End state of the hub.
    pub fn hub_state(&self) -> Vec<EntityView> {
        self.hub
            .snapshot()
            .iter()
            .map(|(key, record)| view(key, record.data.as_deref(), record.timestamp))
            .collect()
    }
}

fn same_state(node: &Node, local: &LocalRecord, remote: &HubRecord) -> bool {
    match (&local.data, &remote.data) {
        (None, None) => true,
        (Some(a), Some(b)) => node
            .engine
            .registry()
            .adapter(&local.key.entity_type)
            .map_or(a == b, |adapter| adapter.equivalent(a, b)),
        _ => false,
    }
}

/// Runs every step of a scenario.
pub fn execute(scenario: &Scenario) -> ScenarioResult<ScenarioReport> {
    let harness = Harness::new(scenario)?;
    let mut steps = Vec::with_capacity(scenario.steps.len());
    for (index, step) in scenario.steps.iter().enumerate() {
        let report = harness.apply(index + 1, step)?;
        debug!(step = report.step, action = report.action, "Step done");
        steps.push(report);
    }

    Ok(ScenarioReport {
        name: scenario.name.clone(),
        steps,
        stores: harness.summaries()?,
        hub: harness.hub_state(),
        divergence: harness.divergence()?,
    })
}

/// Runs the run command.
pub fn run(path: &Path, format: &str, expect_converged: bool) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = Scenario::load(path)?;
    info!(path = %path.display(), steps = scenario.steps.len(), "Running scenario");
    let report = execute(&scenario)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    if expect_converged && !report.divergence.is_empty() {
        return Err(format!("{} entities diverged from the hub", report.divergence.len()).into());
    }
    Ok(())
}

fn print_text_output(report: &ScenarioReport) {
    println!("Scenario: {}", report.name.as_deref().unwrap_or("(unnamed)"));
    println!();

    for step in &report.steps {
        let store = step.store.as_deref().map(|s| format!(" [{s}]")).unwrap_or_default();
        let note = step.note.as_deref().map(|n| format!(": {n}")).unwrap_or_default();
        println!("{:>3}. {}{}{}", step.step, step.action, store, note);
        for cycle in &step.cycles {
            if cycle.paused {
                println!("       store {} paused", cycle.store_id);
            }
            for batch in &cycle.batches {
                println!(
                    "       {} {}: {} records, {} ok, {} failed, {} conflicts ({:?})",
                    batch.direction,
                    batch.entity_type,
                    batch.records,
                    batch.succeeded,
                    batch.failed,
                    batch.conflicts,
                    batch.status
                );
            }
            for skipped in &cycle.skipped {
                println!("       skipped {} {}", skipped.direction, skipped.entity_type);
            }
            for error in &cycle.errors {
                println!("       error: {error}");
            }
        }
    }

    println!();
    println!("Stores:");
    for store in &report.stores {
        let status = &store.status;
        let queue = &status.queue;
        println!(
            "  {} ({}): pending {}, processing {}, completed {}, failed {}, conflicted {}",
            store.name,
            if status.enabled { "enabled" } else { "paused" },
            queue.pending,
            queue.processing,
            queue.completed,
            queue.failed,
            queue.conflicted
        );
        println!(
            "    unresolved conflicts: {}, alerts: {}",
            status.unresolved_conflicts, status.alerts
        );
        if let Some(error) = &status.last_error {
            println!("    last error: {error}");
        }
        for entity in &store.entities {
            print_entity(entity);
        }
    }

    println!();
    println!("Hub:");
    for entity in &report.hub {
        print_entity(entity);
    }

    println!();
    if report.divergence.is_empty() {
        println!("✓ Stores match the hub");
    } else {
        println!("✗ {} differences:", report.divergence.len());
        for difference in &report.divergence {
            println!("    {difference}");
        }
    }
}

fn print_entity(entity: &EntityView) {
    match &entity.data {
        Some(data) => println!("    {} = {} @ {}", entity.key, data, entity.modified.to_rfc3339()),
        None => println!("    {} deleted @ {}", entity.key, entity.modified.to_rfc3339()),
    }
}
