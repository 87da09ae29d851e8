//! Client request admission pipeline.
//!
//! A client op addressed to a placement group is driven through map epoch
//! catch-up, shard resolution, per-(connection, shard) ordering, recovery of
//! missing objects, object locking and execution:
//!
//! - [`Gate`] / [`GateHandle`]: ordered checkpoints with FIFO admission.
//! - [`OpSequencer`]: completion in submission order per (connection, shard).
//! - [`RecoveryTrigger`]: waits for missing or degraded objects to be repaired.
//! - [`is_misdirected`]: whether a non-primary may serve an op.
//! - [`ClientRequest`]: the per-op state machine.
//! - [`OpService`]: the entry point the transport calls with decoded messages.
//! - [`OpTracker`]: registry of in-flight ops for introspection.

pub mod checks;
pub mod error;
pub mod gate;
pub mod recovery;
pub mod request;
pub mod sequencer;
pub mod service;
pub mod tracker;

pub use checks::is_misdirected;
pub use error::{GateError, RequestError, SequencerError};
pub use gate::{Checkpoint, Gate, GateHandle, GateScope};
pub use recovery::RecoveryTrigger;
pub use request::{ClientRequest, RequestState};
pub use sequencer::{OpSequencer, SequencerState};
pub use service::{ConnectionState, OpService};
pub use tracker::{OpSummary, OpTracker};

#[cfg(test)]
mod tests;
