//! Error types for placement group operations.

use tide_types::{CodecError, ObjectId, PgId};

/// Errors surfaced by placement group collaborators.
///
/// Some variants are control signals rather than failures: the request
/// pipeline restarts on [`PgError::ActingSetChanged`] when still primary,
/// retries on [`PgError::Eagain`], and abandons on [`PgError::ShuttingDown`].
#[derive(Debug, thiserror::Error)]
pub enum PgError {
    /// The shard's acting set changed while the op was in flight.
    #[error("acting set changed (still primary: {is_primary})")]
    ActingSetChanged {
        /// Whether this node is still primary in the new interval.
        is_primary: bool,
    },

    /// Execution must be retried from the recovery checkpoint.
    #[error("operation must be retried")]
    Eagain,

    /// Execution failed with a client-visible result code (negated errno).
    #[error("client-visible error {0}")]
    Client(i32),

    /// The object context could not be loaded or validated.
    #[error("failed to load object context: {0}")]
    ObjectLoad(String),

    /// Recovery of an object failed permanently.
    #[error("recovery of {object} failed: {reason}")]
    RecoveryFailed {
        /// Object that could not be recovered.
        object: ObjectId,
        /// Why recovery gave up.
        reason: String,
    },

    /// The placement group is not hosted on this node.
    #[error("placement group {0} not found")]
    PgNotFound(PgId),

    /// The client connection is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// The node is shutting down.
    #[error("node is shutting down")]
    ShuttingDown,

    /// The op payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] CodecError),
}
