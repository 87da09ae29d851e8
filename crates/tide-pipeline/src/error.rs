//! Error types for the request pipeline.

use tide_pg::PgError;
use tide_types::OpId;

use crate::gate::{Checkpoint, GateScope};

/// Errors from entering or leaving pipeline checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The gate was torn down while the op waited or before it arrived.
    #[error("gate closed")]
    Closed,

    /// The op tried to enter a checkpoint while still holding another.
    #[error("{op}: cannot enter {requested} while holding {held}")]
    StillHeld {
        /// Offending op.
        op: OpId,
        /// Checkpoint still held.
        held: Checkpoint,
        /// Checkpoint the op tried to enter.
        requested: Checkpoint,
    },

    /// The op tried to enter a checkpoint at or before one it already passed.
    #[error("{op}: cannot enter {requested} after reaching {reached}")]
    OutOfOrder {
        /// Offending op.
        op: OpId,
        /// Furthest checkpoint reached.
        reached: Checkpoint,
        /// Checkpoint the op tried to enter.
        requested: Checkpoint,
    },

    /// The checkpoint does not belong to the gate it was entered on.
    #[error("{checkpoint} is not a checkpoint of the {scope} gate")]
    WrongScope {
        /// Requested checkpoint.
        checkpoint: Checkpoint,
        /// Scope of the gate it was entered on.
        scope: GateScope,
    },

    /// The op tried to exit a checkpoint it does not hold.
    #[error("{op}: cannot exit {checkpoint}, not held")]
    NotHeld {
        /// Offending op.
        op: OpId,
        /// Checkpoint the op tried to exit.
        checkpoint: Checkpoint,
    },
}

/// Errors from the op sequencer.
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    /// The sequencer was aborted; no further ops are admitted.
    #[error("sequencer aborted")]
    Aborted,

    /// The op asked for admission while still inside a gate checkpoint.
    #[error("{op}: sequencer admission while holding {checkpoint}")]
    StillInGate {
        /// Offending op.
        op: OpId,
        /// Checkpoint still held.
        checkpoint: Checkpoint,
    },
}

/// Any failure inside a client request attempt.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Gate failure.
    #[error("gate error: {0}")]
    Gate(#[from] GateError),

    /// Sequencer failure.
    #[error("sequencer error: {0}")]
    Sequencer(#[from] SequencerError),

    /// Collaborator failure.
    #[error("pg error: {0}")]
    Pg(#[from] PgError),
}
