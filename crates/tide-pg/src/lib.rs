//! Placement group collaborators consumed by the request pipeline.
//!
//! The request pipeline only talks to the rest of the node through the
//! traits defined here:
//!
//! - [`MapGate`]: the node-wide cluster map, consulted as "wait until epoch >= E".
//! - [`PgRegistry`]: resolves a [`PgId`](tide_types::PgId) to a local shard.
//! - [`PlacementGroup`]: the shard itself (role, activation, missing objects,
//!   dedup log, object locking, execution).
//! - [`RecoveryBackend`]: repairs missing or degraded objects.
//! - [`Connection`]: the client transport.
//!
//! In-memory implementations are provided for tests and the simulator:
//!
//! - [`EpochGate`]: watch-based map epoch gate.
//! - [`MemoryPgRegistry`]: registry whose lookups wait for registration.
//! - [`MemoryPg`]: scriptable shard with an in-memory object store.
//! - [`MemoryRecovery`]: recovery registry with shared completion handles.
//! - [`MemoryConnection`]: connection that records every reply.

mod connection;
mod epoch_gate;
mod error;
mod memory_pg;
mod obc;
mod recovery;
mod registry;
mod traits;

pub use connection::MemoryConnection;
pub use epoch_gate::EpochGate;
pub use error::PgError;
pub use memory_pg::{MAX_OBJECT_SIZE, MemoryPg, PgRole};
pub use obc::{LockedContext, ObcLockManager, ObjectState};
pub use recovery::MemoryRecovery;
pub use registry::MemoryPgRegistry;
pub use traits::{
    Connection, MapGate, PgRegistry, PlacementGroup, RecoveryBackend, RecoveryState, RecoveryWait,
};
