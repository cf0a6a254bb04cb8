//! Entity type registry.
//!
//! The engine never inspects payloads itself. Each synchronized entity
//! type registers an [`EntityAdapter`] that knows how to validate,
//! canonicalize and compare its serialized snapshots.

use crate::error::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use storesync_protocol::EntityType;

/// Payload handling for one entity type.
pub trait EntityAdapter: Send + Sync {
    /// Checks that `payload` decodes as this entity type.
    fn validate(&self, payload: &[u8]) -> Result<(), String>;

    /// Re-encodes `payload` in canonical form.
    fn canonicalize(&self, payload: &[u8]) -> Result<Vec<u8>, String>;

    /// Returns true if both snapshots describe the same state.
    fn equivalent(&self, a: &[u8], b: &[u8]) -> bool;
}

/// Schemaless JSON documents.
///
/// Canonical form is compact JSON with sorted object keys, so two
/// documents that differ only in key order or whitespace are equivalent.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonAdapter;

impl EntityAdapter for JsonAdapter {
    fn validate(&self, payload: &[u8]) -> Result<(), String> {
        serde_json::from_slice::<Value>(payload)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn canonicalize(&self, payload: &[u8]) -> Result<Vec<u8>, String> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        serde_json::to_vec(&value).map_err(|e| e.to_string())
    }

    fn equivalent(&self, a: &[u8], b: &[u8]) -> bool {
        match (
            serde_json::from_slice::<Value>(a),
            serde_json::from_slice::<Value>(b),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => a == b,
        }
    }
}

/// JSON documents that must decode as `T`.
///
/// Equivalence is `T`'s own equality, so fields `T` ignores on decode
/// never make two snapshots differ.
pub struct TypedAdapter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedAdapter<T> {
    /// Creates the adapter.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedAdapter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EntityAdapter for TypedAdapter<T>
where
    T: Serialize + DeserializeOwned + PartialEq,
{
    fn validate(&self, payload: &[u8]) -> Result<(), String> {
        serde_json::from_slice::<T>(payload)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn canonicalize(&self, payload: &[u8]) -> Result<Vec<u8>, String> {
        let value: T = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        serde_json::to_vec(&value).map_err(|e| e.to_string())
    }

    fn equivalent(&self, a: &[u8], b: &[u8]) -> bool {
        match (serde_json::from_slice::<T>(a), serde_json::from_slice::<T>(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => a == b,
        }
    }
}

/// Maps entity types to their adapters. Populated once at startup.
#[derive(Default, Clone)]
pub struct EntityRegistry {
    adapters: HashMap<EntityType, Arc<dyn EntityAdapter>>,
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter` for `entity_type`, replacing any previous one.
    pub fn register(
        &mut self,
        entity_type: impl Into<EntityType>,
        adapter: impl EntityAdapter + 'static,
    ) -> &mut Self {
        self.adapters.insert(entity_type.into(), Arc::new(adapter));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, entity_type: impl Into<EntityType>, adapter: impl EntityAdapter + 'static) -> Self {
        self.register(entity_type, adapter);
        self
    }

    /// Returns true if `entity_type` has an adapter.
    pub fn contains(&self, entity_type: &EntityType) -> bool {
        self.adapters.contains_key(entity_type)
    }

    /// Looks up the adapter for `entity_type`.
    pub fn adapter(&self, entity_type: &EntityType) -> SyncResult<&dyn EntityAdapter> {
        self.adapters
            .get(entity_type)
            .map(|a| a.as_ref())
            .ok_or_else(|| SyncError::Validation(format!("unregistered entity type {entity_type}")))
    }

    /// Registered entity types in name order.
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut types: Vec<_> = self.adapters.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entity_types", &self.entity_types())
            .finish()
    }
}
