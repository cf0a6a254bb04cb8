//! # storesync Testkit
//!
//! Test utilities for storesync.
//!
//! This crate provides:
//! - Store fixtures backed by in-memory storage and a manual clock
//! - An in-process hub implementing the sync transport
//! - Multi-store convergence simulation
//! - Property-based test generators using proptest
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use storesync_testkit::prelude::*;
//!
//! #[test]
//! fn stores_converge() {
//!     let sim = Simulation::new(2, ConflictPolicy::LatestTimestampWins);
//!     sim.apply(&SimOp::Edit { store: 0, product: 1, price: 10 });
//!     assert!(sim.settle(10).is_some());
//!     assert_eq!(sim.divergence(), None);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod hub;
pub mod simulation;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::hub::*;
    pub use crate::simulation::*;
    pub use crate::stress::*;
    pub use storesync_protocol::ConflictPolicy;
}

pub use fixtures::*;
pub use generators::*;
pub use hub::*;
pub use simulation::*;
pub use stress::*;
