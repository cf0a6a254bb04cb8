//! # storesync Protocol
//!
//! Sync data model and wire types for storesync.
//!
//! This crate provides:
//! - `SyncConfiguration` and `SyncEntityRule` (the tunable surface)
//! - `SyncQueueItem` and its status state machine
//! - `SyncBatch` / `SyncRecord` with idempotent outcome counters
//! - `SyncConflict`, `ConflictPolicy` and `ConflictResolution`
//! - `SyncLogEntry` for the append-only audit trail
//! - `RecordOutcome`, the per-record result returned by a transport
//! - CBOR encoding of batch payloads
//!
//! This is a pure data crate with no I/O operations.
//!
//! ## Versioned rows
//!
//! Every persisted row carries a `version` counter. Storage backends
//! compare it against the caller's expected version on each write, so
//! concurrent writers never silently overwrite each other.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod codec;
mod config;
mod conflict;
mod error;
mod ids;
mod log;
mod outcome;
mod queue;

pub use batch::{BatchDirection, BatchStatus, SyncBatch, SyncRecord};
pub use codec::{decode_records, encode_records, BatchEnvelope, ENVELOPE_VERSION};
pub use config::{SyncConfiguration, SyncDirection, SyncEntityRule};
pub use conflict::{
    snapshot_digest, ConflictPolicy, ConflictResolution, ConflictStatus, SyncConflict,
};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{EntityKey, EntityType, StoreId};
pub use log::{LogEvent, SyncLogEntry};
pub use outcome::RecordOutcome;
pub use queue::{OperationType, QueueItemStatus, SyncQueueItem};
