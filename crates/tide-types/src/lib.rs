//! Shared types and identifiers for Tidepool.
//!
//! This crate defines the core types used across the Tidepool workspace:
//! identifiers ([`ObjectId`], [`PgId`], [`RequestId`], [`OpId`],
//! [`ConnectionId`]), the cluster map version ([`Epoch`]), the decoded
//! client operation ([`ClientMessage`]) with its classification
//! ([`OpInfo`]), and the replies sent back to clients ([`OpReply`],
//! [`Reply`]).

pub mod events;
mod message;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use message::{
    ClientMessage, CodecError, OpFlags, OpInfo, OpReply, OpResult, Reply, SubOp, encode_ops,
};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short form: the first 8 bytes are plenty to tell objects apart in logs.
                for byte in &self.0[..8] {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// Identifier for an object: `blake3(object_name)`.
    ObjectId
);

impl ObjectId {
    /// Derive the identifier for a named object.
    pub fn from_name(name: &str) -> Self {
        Self::from_data(name.as_bytes())
    }
}

/// Version number of the cluster map.
///
/// Epochs grow monotonically; every topology or ownership change publishes
/// a new one.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct Epoch(pub u32);

impl Epoch {
    /// Return the next epoch.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

/// Node-local identifier of an in-flight client operation.
///
/// Assigned in arrival order; `OpId(0)` is never handed out and stands for
/// "no previous operation" in the per-shard ordering chain.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct OpId(pub u64);

impl OpId {
    /// The "no operation" sentinel.
    pub const NONE: OpId = OpId(0);
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({})", self.0)
    }
}

/// Identifier of a client transport connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Identifier of a placement group (replicated shard).
///
/// `shard` is [`PgId::NO_SHARD`] for replicated pools and the shard index
/// for erasure-coded ones.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PgId {
    /// Pool the placement group belongs to.
    pub pool: u64,
    /// Placement seed within the pool.
    pub seed: u32,
    /// Shard index, or [`PgId::NO_SHARD`].
    pub shard: i8,
}

impl PgId {
    /// Shard value for replicated (non-erasure-coded) pools.
    pub const NO_SHARD: i8 = -1;

    /// Create a placement group id for a replicated pool.
    pub fn new(pool: u64, seed: u32) -> Self {
        Self {
            pool,
            seed,
            shard: Self::NO_SHARD,
        }
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)?;
        if self.shard != Self::NO_SHARD {
            write!(f, "s{}", self.shard)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PgId({self})")
    }
}

/// Client-assigned request identifier, stable across client resends.
///
/// The `(client, incarnation, tid)` triple is what the idempotence log is
/// keyed on: a resent request carries the same id as the original.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RequestId {
    /// Global client id.
    pub client: u64,
    /// Client incarnation, bumped on client restart.
    pub incarnation: u32,
    /// Per-client transaction id.
    pub tid: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client.{}.{}:{}", self.client, self.incarnation, self.tid)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({self})")
    }
}

/// Error numbers carried (negated) in [`OpReply::result`].
pub mod errno {
    /// No such object.
    pub const ENOENT: i32 = 2;
    /// I/O error; used when recovery of an object fails permanently.
    pub const EIO: i32 = 5;
    /// Try again; returned when a replica cannot serve a read.
    pub const EAGAIN: i32 = 11;
    /// Object already exists.
    pub const EEXIST: i32 = 17;
    /// Object would exceed the maximum object size.
    pub const EFBIG: i32 = 27;
    /// Invalid argument.
    pub const EINVAL: i32 = 22;
    /// No such attribute.
    pub const ENODATA: i32 = 61;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
