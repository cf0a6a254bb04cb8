//! # storesync engine
//!
//! Queue, batcher and conflict handling for point-of-sale stores that
//! synchronize with a headquarters hub.
//!
//! This crate provides:
//! - Change recording and the outbound sync queue
//! - Batch exchange through a pluggable transport
//! - Conflict detection and policy-driven resolution
//! - Retry with exponential backoff
//! - An append-only sync log mirrored to `tracing`
//! - Operator controls (pause, cancel, manual resolution, status)
//! - A tokio scheduler running one cycle task per store
//!
//! ## Architecture
//!
//! Every cycle follows a **pull-then-push** model per entity rule:
//! 1. Pull remote changes and classify each against local state
//! 2. Apply clean changes, settle or park conflicts
//! 3. Push queued local changes and settle each acknowledgment
//!
//! ## Key Invariants
//!
//! - Pull always happens before push within a rule
//! - At most one batch per (store, direction, entity type) is in flight
//! - Applying the same incoming record twice changes nothing
//! - Every failure ends in a persisted status plus a log entry

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod admin;
mod clock;
mod detector;
mod engine;
mod error;
mod log;
mod queue;
mod recorder;
mod registry;
mod resolver;
mod retry;
mod scheduler;
mod single_flight;
mod transport;

pub use admin::{ManualResolution, QueueCounts, StoreStatus, ORPHAN_LEASE_MARGIN_SECS};
pub use clock::{Clock, ManualClock, SystemClock};
pub use detector::{classify, Classification, Incoming};
pub use engine::{BatchReport, CycleReport, SkippedPartition, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use log::SyncLog;
pub use queue::SyncQueue;
pub use registry::{EntityAdapter, EntityRegistry, JsonAdapter, TypedAdapter};
pub use resolver::ResolutionChoice;
pub use retry::{RetryPolicy, RetryStep};
pub use scheduler::SyncScheduler;
pub use single_flight::{FlightGuard, FlightKey, SingleFlight};
pub use transport::{MockReply, MockTransport, SyncTransport};
