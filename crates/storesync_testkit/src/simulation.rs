//! Multi-store convergence simulation.
//!
//! Several stores share one [`LoopbackHub`] and one manual clock. A
//! sequence of [`SimOp`]s interleaves local edits, hub edits and sync
//! cycles; [`Simulation::settle`] then cycles every store until nothing
//! moves, after which every store should hold the hub's state.

use crate::fixtures::{product_body, product_registry, StoreNode, PRODUCT};
use crate::hub::LoopbackHub;
use chrono::Duration;
use std::sync::Arc;
use storesync_engine::{Clock, ManualClock};
use storesync_protocol::{ConflictPolicy, EntityKey, EntityType};

/// One step of a simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    /// A store edits a product.
    Edit {
        /// Store index.
        store: usize,
        /// Product index.
        product: u8,
        /// New price.
        price: u32,
    },
    /// A store deletes a product.
    Delete {
        /// Store index.
        store: usize,
        /// Product index.
        product: u8,
    },
    /// Headquarters edits a product.
    HubEdit {
        /// Product index.
        product: u8,
        /// New price.
        price: u32,
    },
    /// A store runs one cycle.
    Cycle {
        /// Store index.
        store: usize,
    },
    /// Time passes.
    Tick {
        /// Seconds.
        secs: u32,
    },
}

/// Stores syncing through a shared hub.
pub struct Simulation {
    /// The hub.
    pub hub: Arc<LoopbackHub>,
    /// Shared clock.
    pub clock: Arc<ManualClock>,
    /// The stores.
    pub nodes: Vec<StoreNode<Arc<LoopbackHub>>>,
}

/// Product id for an index.
pub fn product_id(product: u8) -> String {
    format!("p-{product}")
}

impl Simulation {
    /// Creates `stores` stores resolving conflicts with `policy`.
    pub fn new(stores: usize, policy: ConflictPolicy) -> Self {
        let hub = Arc::new(LoopbackHub::new(product_registry()));
        let clock = Arc::new(ManualClock::new(crate::fixtures::ts(1_000)));
        let nodes = (0..stores)
            .map(|_| StoreNode::new(Arc::clone(&hub), Arc::clone(&clock), policy))
            .collect();
        Self { hub, clock, nodes }
    }

    /// Applies one step. Store indexes wrap around.
    pub fn apply(&self, op: &SimOp) {
        match *op {
            SimOp::Edit {
                store,
                product,
                price,
            } => {
                self.node(store).edit(&product_id(product), price);
            }
            SimOp::Delete { store, product } => {
                self.node(store).delete(&product_id(product));
            }
            SimOp::HubEdit { product, price } => self.hub.edit(
                EntityKey::new(PRODUCT, product_id(product)),
                Some(product_body(price)),
                self.clock.now(),
            ),
            SimOp::Cycle { store } => {
                let node = self.node(store);
                node.engine
                    .run_cycle(node.store_id)
                    .expect("Cycle failed");
            }
            SimOp::Tick { secs } => self.clock.advance(Duration::seconds(i64::from(secs))),
        }
    }

    fn node(&self, store: usize) -> &StoreNode<Arc<LoopbackHub>> {
        &self.nodes[store % self.nodes.len()]
    }

    /// Cycles every store until a full round exchanges nothing and every
    /// queue is drained. Returns the number of rounds, or `None` if the
    /// stores were still busy after `max_rounds`.
    pub fn settle(&self, max_rounds: usize) -> Option<usize> {
        for round in 1..=max_rounds {
            let mut quiet = true;
            for node in &self.nodes {
                let report = node.engine.run_cycle(node.store_id).expect("Cycle failed");
                quiet &= report.is_noop();
            }
            self.clock.advance(Duration::seconds(1));
            if quiet && self.nodes.iter().all(|node| node.is_idle()) {
                return Some(round);
            }
        }
        None
    }

    /// Describes the first difference between a store and the hub, or
    /// returns `None` when every store matches the hub exactly.
    pub fn divergence(&self) -> Option<String> {
        let registry = product_registry();
        let adapter = registry
            .adapter(&EntityType::new(PRODUCT))
            .expect("product adapter registered");
        let hub = self.hub.snapshot();

        for (index, node) in self.nodes.iter().enumerate() {
            let local = node.products();
            if local.len() != hub.len() {
                return Some(format!(
                    "store {index} holds {} products, hub holds {}",
                    local.len(),
                    hub.len()
                ));
            }
            for (record, (key, hub_record)) in local.iter().zip(&hub) {
                if record.key != *key {
                    return Some(format!("store {index} has {} where hub has {key}", record.key));
                }
                let same = match (&record.data, &hub_record.data) {
                    (None, None) => true,
                    (Some(a), Some(b)) => adapter.equivalent(a, b),
                    _ => false,
                };
                if !same {
                    return Some(format!(
                        "store {index} differs from hub on {key}: {:?} vs {:?}",
                        record.data.as_deref().map(String::from_utf8_lossy),
                        hub_record.data.as_deref().map(String::from_utf8_lossy),
                    ));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_edits_converge_to_the_latest() {
        let sim = Simulation::new(2, ConflictPolicy::LatestTimestampWins);
        sim.apply(&SimOp::Edit {
            store: 0,
            product: 1,
            price: 10,
        });
        sim.apply(&SimOp::Tick { secs: 5 });
        sim.apply(&SimOp::Edit {
            store: 1,
            product: 1,
            price: 20,
        });
        sim.apply(&SimOp::Cycle { store: 1 });
        sim.apply(&SimOp::Cycle { store: 0 });

        assert!(sim.settle(10).is_some());
        assert_eq!(sim.divergence(), None);
        let hub = sim.hub.get(&EntityKey::new(PRODUCT, "p-1")).unwrap();
        assert_eq!(hub.data, Some(product_body(20)));
    }

    #[test]
    fn hub_edits_reach_every_store() {
        let sim = Simulation::new(3, ConflictPolicy::RemoteWins);
        sim.apply(&SimOp::HubEdit {
            product: 7,
            price: 70,
        });
        sim.apply(&SimOp::Delete {
            store: 2,
            product: 8,
        });

        assert!(sim.settle(10).is_some());
        assert_eq!(sim.divergence(), None);
        for node in &sim.nodes {
            assert_eq!(node.local("p-7").unwrap().data, Some(product_body(70)));
            assert!(node.local("p-8").unwrap().is_deleted());
        }
    }
}
