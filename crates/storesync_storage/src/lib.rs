//! # storesync Storage
//!
//! Storage collaborator traits and the in-memory reference backend.
//!
//! The sync engine never talks to a database directly. It consumes two
//! narrow traits:
//!
//! - [`SyncStore`] - configuration, rules, queue items, batches,
//!   conflicts and the sync log
//! - [`EntityStore`] - the local copy of each synchronized entity
//!
//! ## Design Principles
//!
//! - Every mutating call takes the version the caller last read; a
//!   mismatch fails with [`StorageError::VersionConflict`] instead of
//!   overwriting a concurrent change
//! - [`SyncStore::claim_pending`] is the only read-modify-write the engine
//!   needs to be atomic; backends must make it exclusive across callers
//! - Backends must be `Send + Sync` for concurrent access
//!
//! ## Example
//!
//! ```rust
//! use storesync_protocol::{StoreId, SyncConfiguration};
//! use storesync_storage::{InMemoryStore, SyncStore};
//!
//! let store = InMemoryStore::new();
//! let config = store
//!     .insert_configuration(SyncConfiguration::new(StoreId::new()))
//!     .unwrap();
//! assert_eq!(config.version, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod entity;
mod error;
mod filter;
mod memory;

pub use backend::SyncStore;
pub use entity::{EntityStore, InMemoryEntityStore, LocalRecord};
pub use error::{StorageError, StorageResult};
pub use filter::{ConflictFilter, QueueClaim, QueueFilter};
pub use memory::InMemoryStore;
