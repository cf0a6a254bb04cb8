//! Property-based test generators using proptest.
//!
//! Provides strategies for generating simulation steps, product payloads
//! and store tuning that stay inside the ranges the engine accepts.

use crate::fixtures::product_body;
use crate::simulation::SimOp;
use proptest::prelude::*;
use storesync_protocol::{ConflictPolicy, StoreId, SyncConfiguration};

/// Strategy for product indexes below `products`.
pub fn product_strategy(products: u8) -> impl Strategy<Value = u8> {
    0..products.max(1)
}

/// Strategy for product prices.
pub fn price_strategy() -> impl Strategy<Value = u32> {
    1u32..10_000
}

/// Strategy for JSON product bodies.
pub fn product_body_strategy() -> impl Strategy<Value = Vec<u8>> {
    price_strategy().prop_map(product_body)
}

/// Strategy for queue priorities.
pub fn priority_strategy() -> impl Strategy<Value = i32> {
    -5i32..=5
}

/// Strategy for policies under which stores converge without an operator.
pub fn converging_policy_strategy() -> impl Strategy<Value = ConflictPolicy> {
    prop_oneof![
        Just(ConflictPolicy::LatestTimestampWins),
        Just(ConflictPolicy::RemoteWins),
    ]
}

/// Strategy for a single simulation step over `stores` stores and
/// `products` products.
///
/// Cycles are weighted up so that most sequences exchange something
/// before they end.
pub fn sim_op_strategy(stores: usize, products: u8) -> impl Strategy<Value = SimOp> {
    let stores = stores.max(1);
    prop_oneof![
        4 => (0..stores, product_strategy(products), price_strategy())
            .prop_map(|(store, product, price)| SimOp::Edit { store, product, price }),
        1 => (0..stores, product_strategy(products))
            .prop_map(|(store, product)| SimOp::Delete { store, product }),
        2 => (product_strategy(products), price_strategy())
            .prop_map(|(product, price)| SimOp::HubEdit { product, price }),
        4 => (0..stores).prop_map(|store| SimOp::Cycle { store }),
        2 => (1u32..120).prop_map(|secs| SimOp::Tick { secs }),
    ]
}

/// Strategy for a sequence of simulation steps.
pub fn sim_sequence_strategy(
    stores: usize,
    products: u8,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<SimOp>> {
    prop::collection::vec(sim_op_strategy(stores, products), min_ops..max_ops)
}

/// Strategy for store configurations with arbitrary retry tuning.
///
/// The backoff cap is never below the initial delay.
pub fn retry_config_strategy() -> impl Strategy<Value = SyncConfiguration> {
    (1u32..8, 1u64..120, 0u64..3_600, 1u32..500).prop_map(
        |(attempts, delay, extra, batch_size)| {
            SyncConfiguration::new(StoreId::new())
                .with_retry_attempts(attempts)
                .with_retry_delay_secs(delay)
                .with_max_retry_delay_secs(delay + extra)
                .with_max_batch_size(batch_size)
        },
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 128,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 512,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storesync_engine::{EntityRegistry, JsonAdapter, RetryPolicy};
    use storesync_protocol::EntityType;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn sim_ops_stay_in_range(op in sim_op_strategy(3, 4)) {
            match op {
                SimOp::Edit { store, product, .. } | SimOp::Delete { store, product } => {
                    prop_assert!(store < 3);
                    prop_assert!(product < 4);
                }
                SimOp::HubEdit { product, .. } => prop_assert!(product < 4),
                SimOp::Cycle { store } => prop_assert!(store < 3),
                SimOp::Tick { secs } => prop_assert!(secs > 0),
            }
        }

        #[test]
        fn product_bodies_are_valid_json(body in product_body_strategy()) {
            let registry = EntityRegistry::new().with("product", JsonAdapter);
            let adapter = registry.adapter(&EntityType::new("product")).unwrap();
            prop_assert!(adapter.validate(&body).is_ok());
        }

        #[test]
        fn backoff_never_exceeds_the_cap(config in retry_config_strategy(), attempts in 1u32..40) {
            let policy = RetryPolicy::from_config(&config);
            let delay = policy.delay_for_attempt(attempts);
            prop_assert!(delay <= policy.max_delay);
            prop_assert!(delay >= policy.initial_delay.min(policy.max_delay));
        }
    }
}
