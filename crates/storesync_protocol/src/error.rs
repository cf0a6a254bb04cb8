//! Error types for the sync data model.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by data model invariants and payload codecs.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// A status change outside the allowed state machine.
    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        /// Kind of row being transitioned.
        entity: &'static str,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A row violates one of its documented invariants.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl ProtocolError {
    pub(crate) fn transition(
        entity: &'static str,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
}
