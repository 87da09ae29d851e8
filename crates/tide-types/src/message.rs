//! Client operation messages and replies.
//!
//! A [`ClientMessage`] arrives with its header (target placement group,
//! object, flags, epochs, request id) already decoded. The sub-operation
//! vector may still be an opaque postcard payload; [`ClientMessage::finish_decode`]
//! turns it into [`SubOp`]s once the request has been admitted.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Epoch, ObjectId, PgId, RequestId};

/// Errors from encoding or decoding a sub-operation payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload could not be serialized.
    #[error("failed to encode op payload: {0}")]
    Encode(String),

    /// The payload bytes are not a valid sub-operation vector.
    #[error("malformed op payload: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    /// Request flags set by the client.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OpFlags: u32 {
        /// Client wants an acknowledgement once the op is applied.
        const ACK            = 0x0001;
        /// Client wants an acknowledgement once the op is durable.
        const ONDISK         = 0x0004;
        /// Reads may be served by any replica.
        const BALANCE_READS  = 0x0100;
        /// Reads may be served by the closest replica.
        const LOCALIZE_READS = 0x2000;
        /// Client wants the per-op result vector in the reply.
        const RETURNVEC      = 0x0400_0000;
    }
}

impl fmt::Display for OpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            f.write_str(&name.to_ascii_lowercase())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sub-operations
// ---------------------------------------------------------------------------

/// A single sub-operation of a client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubOp {
    /// Read `length` bytes at `offset` (0 means "to the end").
    Read {
        /// Start offset.
        offset: u64,
        /// Number of bytes.
        length: u64,
    },
    /// Return the object size.
    Stat,
    /// Read one extended attribute.
    GetXattr {
        /// Attribute name.
        name: String,
    },
    /// Create the object.
    Create {
        /// Fail with `EEXIST` if the object exists.
        exclusive: bool,
    },
    /// Write `data` at `offset`, extending the object as needed.
    Write {
        /// Start offset.
        offset: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Replace the whole object body.
    WriteFull {
        /// New body.
        data: Vec<u8>,
    },
    /// Set one extended attribute.
    SetXattr {
        /// Attribute name.
        name: String,
        /// Attribute value.
        value: Vec<u8>,
    },
    /// Remove the object.
    Delete,
    /// Flush the object from the cache tier.
    CacheFlush,
    /// Evict the object from the cache tier.
    CacheEvict,
    /// List objects in the placement group (administrative).
    PgList {
        /// Maximum number of names returned.
        max_entries: u32,
    },
}

impl SubOp {
    /// Whether this sub-op reads object data or metadata.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            SubOp::Read { .. } | SubOp::Stat | SubOp::GetXattr { .. } | SubOp::PgList { .. }
        )
    }

    /// Whether this sub-op mutates the object.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            SubOp::Create { .. }
                | SubOp::Write { .. }
                | SubOp::WriteFull { .. }
                | SubOp::SetXattr { .. }
                | SubOp::Delete
        )
    }

    /// Whether this sub-op manipulates the cache tier.
    pub fn is_cache(&self) -> bool {
        matches!(self, SubOp::CacheFlush | SubOp::CacheEvict)
    }

    /// Whether this sub-op addresses the placement group rather than an object.
    pub fn is_pg_op(&self) -> bool {
        matches!(self, SubOp::PgList { .. })
    }
}

impl fmt::Display for SubOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubOp::Read { offset, length } => write!(f, "read {offset}~{length}"),
            SubOp::Stat => f.write_str("stat"),
            SubOp::GetXattr { name } => write!(f, "getxattr {name}"),
            SubOp::Create { exclusive } => {
                write!(f, "create{}", if *exclusive { " excl" } else { "" })
            }
            SubOp::Write { offset, data } => write!(f, "write {offset}~{}", data.len()),
            SubOp::WriteFull { data } => write!(f, "writefull 0~{}", data.len()),
            SubOp::SetXattr { name, value } => write!(f, "setxattr {name} ({})", value.len()),
            SubOp::Delete => f.write_str("delete"),
            SubOp::CacheFlush => f.write_str("cache-flush"),
            SubOp::CacheEvict => f.write_str("cache-evict"),
            SubOp::PgList { max_entries } => write!(f, "pgls {max_entries}"),
        }
    }
}

/// Serialize a sub-operation vector into a wire payload.
pub fn encode_ops(ops: &[SubOp]) -> Result<Bytes, CodecError> {
    postcard::to_allocvec(ops)
        .map(Bytes::from)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Read/write/cache classification of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpInfo {
    may_read: bool,
    may_write: bool,
    may_cache: bool,
}

impl OpInfo {
    /// Classify a sub-operation vector.
    pub fn from_ops(ops: &[SubOp]) -> Self {
        ops.iter().fold(Self::default(), |info, op| Self {
            may_read: info.may_read || op.is_read(),
            may_write: info.may_write || op.is_write(),
            may_cache: info.may_cache || op.is_cache(),
        })
    }

    /// Whether any sub-op reads.
    pub fn may_read(&self) -> bool {
        self.may_read
    }

    /// Whether any sub-op writes.
    pub fn may_write(&self) -> bool {
        self.may_write
    }

    /// Whether any sub-op touches the cache tier.
    pub fn may_cache(&self) -> bool {
        self.may_cache
    }
}

// ---------------------------------------------------------------------------
// ClientMessage
// ---------------------------------------------------------------------------

/// A client request addressed to one object of one placement group.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    /// Client request id (idempotence key).
    pub reqid: RequestId,
    /// Target placement group.
    pub pgid: PgId,
    /// Target object name.
    pub object: String,
    /// Client flags.
    pub flags: OpFlags,
    /// Map epoch the client used to target this request.
    pub map_epoch: Epoch,
    /// Minimum map epoch the serving node must have seen.
    pub min_epoch: Epoch,
    object_id: ObjectId,
    ops: Vec<SubOp>,
    payload: Option<Bytes>,
}

impl ClientMessage {
    /// Build a fully decoded message.
    pub fn new(
        reqid: RequestId,
        pgid: PgId,
        object: impl Into<String>,
        ops: Vec<SubOp>,
    ) -> Self {
        let object = object.into();
        Self {
            reqid,
            pgid,
            object_id: ObjectId::from_name(&object),
            object,
            flags: OpFlags::ACK | OpFlags::ONDISK,
            map_epoch: Epoch::default(),
            min_epoch: Epoch::default(),
            ops: Vec::new(),
            payload: None,
        }
        .with_ops(ops)
    }

    /// Build a message whose sub-op vector is still an encoded payload.
    pub fn with_payload(
        reqid: RequestId,
        pgid: PgId,
        object: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        let mut msg = Self::new(reqid, pgid, object, Vec::new());
        msg.payload = Some(payload);
        msg
    }

    fn with_ops(mut self, ops: Vec<SubOp>) -> Self {
        self.ops = ops;
        self
    }

    /// Replace the client flags.
    pub fn with_flags(mut self, flags: OpFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the client's map epoch and the minimum epoch required to serve it.
    pub fn with_epochs(mut self, map_epoch: Epoch, min_epoch: Epoch) -> Self {
        self.map_epoch = map_epoch;
        self.min_epoch = min_epoch;
        self
    }

    /// The target object's identifier.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Decoded sub-operations (empty until [`finish_decode`](Self::finish_decode)
    /// for lazily decoded messages).
    pub fn ops(&self) -> &[SubOp] {
        &self.ops
    }

    /// Whether the sub-op payload still needs decoding.
    pub fn is_decoded(&self) -> bool {
        self.payload.is_none()
    }

    /// Whether the client set `flag`.
    pub fn has_flag(&self, flag: OpFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Decode the remaining payload, if any, and drop it.
    ///
    /// Returns `true` if a payload was decoded by this call.
    pub fn finish_decode(&mut self) -> Result<bool, CodecError> {
        let Some(payload) = self.payload.take() else {
            return Ok(false);
        };
        self.ops = postcard::from_bytes(&payload).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(true)
    }

    /// Whether any sub-op addresses the placement group itself.
    pub fn is_pg_op(&self) -> bool {
        self.ops.iter().any(SubOp::is_pg_op)
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} [", self.reqid, self.pgid, self.object)?;
        if self.payload.is_some() {
            f.write_str("<undecoded>")?;
        }
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{op}")?;
        }
        write!(f, "] {} {}", self.flags, self.map_epoch)
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Result of one sub-operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    /// Return value (0 or negated errno).
    pub rval: i32,
    /// Output data.
    pub out: Vec<u8>,
}

/// Reply to a client operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpReply {
    /// Request being answered.
    pub reqid: RequestId,
    /// Placement group that answered.
    pub pgid: PgId,
    /// Target object.
    pub object: ObjectId,
    /// Overall result (0 or negated errno).
    pub result: i32,
    /// Map epoch of the answering placement group.
    pub epoch: Epoch,
    /// Acknowledgement flags.
    pub flags: OpFlags,
    /// Per-op results; empty when out-data is not returned.
    pub results: Vec<OpResult>,
}

impl OpReply {
    /// Build a reply carrying only a result code.
    ///
    /// With `ignore_out_data` unset, every sub-op gets an entry carrying
    /// `result` and no output.
    pub fn new(
        msg: &ClientMessage,
        result: i32,
        epoch: Epoch,
        flags: OpFlags,
        ignore_out_data: bool,
    ) -> Self {
        let results = if ignore_out_data {
            Vec::new()
        } else {
            msg.ops()
                .iter()
                .map(|_| OpResult {
                    rval: result,
                    out: Vec::new(),
                })
                .collect()
        };
        Self::with_results(msg, result, epoch, flags, results)
    }

    /// Build a reply with explicit per-op results.
    pub fn with_results(
        msg: &ClientMessage,
        result: i32,
        epoch: Epoch,
        flags: OpFlags,
        results: Vec<OpResult>,
    ) -> Self {
        Self {
            reqid: msg.reqid,
            pgid: msg.pgid,
            object: msg.object_id(),
            result,
            epoch,
            flags,
            results,
        }
    }
}

/// Anything the node sends back on a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Answer to an executed (or deduplicated, or rejected) operation.
    Op(OpReply),
    /// The request targeted a stale map; the client should refresh its map
    /// from `requested` up to `current` and resend.
    MapAdvisory {
        /// Request that triggered the advisory.
        reqid: RequestId,
        /// Epoch the client sent the request with.
        requested: Epoch,
        /// Current node epoch.
        current: Epoch,
    },
}

impl Reply {
    /// Request this reply answers.
    pub fn reqid(&self) -> RequestId {
        match self {
            Reply::Op(reply) => reply.reqid,
            Reply::MapAdvisory { reqid, .. } => *reqid,
        }
    }

    /// The operation reply, if this is one.
    pub fn as_op(&self) -> Option<&OpReply> {
        match self {
            Reply::Op(reply) => Some(reply),
            Reply::MapAdvisory { .. } => None,
        }
    }
}
