//! Single-flight guard for batch partitions.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::Hash;
use storesync_protocol::{BatchDirection, EntityType, StoreId};

/// Identifies one queue partition: at most one batch per key is in flight.
pub type FlightKey = (StoreId, BatchDirection, EntityType);

/// Tracks keys with an execution in progress.
#[derive(Debug)]
pub struct SingleFlight<K: Eq + Hash + Clone> {
    active: Mutex<HashSet<K>>,
}

/// Releases its key when dropped.
#[derive(Debug)]
pub struct FlightGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a SingleFlight<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    /// Creates an empty guard set.
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Claims `key`, or returns `None` if another execution holds it.
    pub fn try_acquire(&self, key: K) -> Option<FlightGuard<'_, K>> {
        let mut active = self.active.lock();
        if !active.insert(key.clone()) {
            return None;
        }
        Some(FlightGuard { owner: self, key })
    }

    /// Returns true if `key` is held.
    pub fn is_active(&self, key: &K) -> bool {
        self.active.lock().contains(key)
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> Drop for FlightGuard<'_, K> {
    fn drop(&mut self) {
        self.owner.active.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let flights = SingleFlight::new();
        let key = (StoreId::new(), BatchDirection::Push, EntityType::new("product"));

        let guard = flights.try_acquire(key.clone()).unwrap();
        assert!(flights.try_acquire(key.clone()).is_none());
        assert!(flights.is_active(&key));

        drop(guard);
        assert!(!flights.is_active(&key));
        assert!(flights.try_acquire(key).is_some());
    }

    #[test]
    fn keys_are_independent() {
        let flights = SingleFlight::new();
        let store = StoreId::new();
        let _push = flights
            .try_acquire((store, BatchDirection::Push, EntityType::new("product")))
            .unwrap();
        assert!(flights
            .try_acquire((store, BatchDirection::Pull, EntityType::new("product")))
            .is_some());
        assert!(flights
            .try_acquire((store, BatchDirection::Push, EntityType::new("price")))
            .is_some());
    }
}
