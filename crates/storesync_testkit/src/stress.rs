//! Stress tests for the sync engine.
//!
//! These runs verify behavior under heavy change volume and concurrent
//! stores sharing one hub.

use crate::fixtures::{product_body, ts, StoreNode, PRODUCT};
use crate::simulation::{product_id, Simulation};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use storesync_engine::{ManualClock, MockTransport};
use storesync_protocol::{ConflictPolicy, EntityKey, OperationType};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Changes recorded per store.
    pub changes: usize,
    /// Number of concurrent stores (for concurrent tests).
    pub stores: usize,
    /// Number of distinct products.
    pub products: u8,
    /// Changes recorded between two cycles of the same store.
    pub cycle_every: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            changes: 2_000,
            stores: 4,
            products: 50,
            cycle_every: 25,
        }
    }
}

/// Records `config.changes` edits on one store and drains them through
/// an always-accepting transport.
///
/// Every recorded change and every cycle counts as one operation.
pub fn stress_single_store(config: &StressConfig) -> StressTestResult {
    let clock = Arc::new(ManualClock::new(ts(1_000)));
    let node = StoreNode::new(
        MockTransport::new(),
        Arc::clone(&clock),
        ConflictPolicy::LatestTimestampWins,
    );

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.changes {
        let key = EntityKey::new(PRODUCT, product_id((i % usize::from(config.products.max(1))) as u8));
        match node.engine.record_change(
            node.store_id,
            key,
            OperationType::Update,
            product_body(i as u32),
            0,
        ) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
        clock.advance(chrono::Duration::seconds(1));
    }

    while !node.is_idle() {
        match node.engine.run_cycle(node.store_id) {
            Ok(report) if report.is_success() => successful += 1,
            _ => {
                failed += 1;
                break;
            }
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Runs `config.stores` stores on separate threads against one hub,
/// each recording edits and cycling as it goes, then settles them.
///
/// Returns the run result and the simulation so callers can inspect
/// convergence.
pub fn stress_concurrent_stores(config: &StressConfig) -> (StressTestResult, Simulation) {
    let sim = Simulation::new(config.stores.max(1), ConflictPolicy::LatestTimestampWins);
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let products = usize::from(config.products.max(1));
    let cycle_every = config.cycle_every.max(1);

    let start = Instant::now();

    thread::scope(|scope| {
        for (t, node) in sim.nodes.iter().enumerate() {
            let clock = Arc::clone(&sim.clock);
            let (successful, failed) = (&successful, &failed);
            scope.spawn(move || {
                for i in 0..config.changes {
                    let key = EntityKey::new(PRODUCT, product_id(((t + i) % products) as u8));
                    let result = node.engine.record_change(
                        node.store_id,
                        key,
                        OperationType::Update,
                        product_body((t * config.changes + i) as u32),
                        0,
                    );
                    clock.advance(chrono::Duration::seconds(1));
                    let result = result.map(|_| ()).and_then(|()| {
                        if (i + 1) % cycle_every == 0 {
                            node.engine.run_cycle(node.store_id).map(|_| ())
                        } else {
                            Ok(())
                        }
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });

    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );
    (result, sim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_store() {
        let config = StressConfig {
            changes: 500,
            products: 20,
            ..Default::default()
        };

        let result = stress_single_store(&config);
        assert_eq!(result.failed_ops, 0);
        assert!(result.successful_ops >= 500);
    }

    #[test]
    fn test_concurrent_stores_converge() {
        let config = StressConfig {
            changes: 200,
            stores: 4,
            products: 10,
            cycle_every: 20,
        };

        let (result, sim) = stress_concurrent_stores(&config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 800);

        assert!(sim.settle(50).is_some());
        assert_eq!(sim.divergence(), None);
        assert_eq!(sim.hub.snapshot().len(), 10);
    }
}
