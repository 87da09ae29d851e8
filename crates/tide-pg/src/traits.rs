//! Collaborator traits consumed by the request pipeline.

use std::sync::Arc;

use tide_types::{
    ClientMessage, ConnectionId, Epoch, ObjectId, OpInfo, OpReply, PgId, Reply, RequestId,
};
use tokio::sync::watch;

use crate::error::PgError;
use crate::obc::LockedContext;

/// Node-wide cluster map epoch.
#[async_trait::async_trait]
pub trait MapGate: Send + Sync {
    /// Resolve once the node has seen a map at least as new as `min`.
    ///
    /// Returns the epoch that satisfied the wait.
    async fn wait_for_epoch(&self, min: Epoch) -> Result<Epoch, PgError>;

    /// Latest epoch seen by the node.
    fn current_epoch(&self) -> Epoch;
}

/// Looks up locally hosted placement groups.
#[async_trait::async_trait]
pub trait PgRegistry: Send + Sync {
    /// Resolve `pgid` to its local shard, waiting until it is instantiated.
    async fn resolve_shard(&self, pgid: PgId) -> Result<Arc<dyn PlacementGroup>, PgError>;
}

/// One locally hosted placement group.
///
/// Wait methods surface [`PgError::ActingSetChanged`] when the shard's
/// interval changes underneath them.
#[async_trait::async_trait]
pub trait PlacementGroup: Send + Sync {
    /// The placement group id.
    fn id(&self) -> PgId;

    /// Map epoch the shard has consumed.
    fn map_epoch(&self) -> Epoch;

    /// First epoch of the current interval (acting set unchanged since).
    fn interval_start_epoch(&self) -> Epoch;

    /// Resolve once the shard has consumed a map at least as new as `min`.
    async fn wait_for_epoch(&self, min: Epoch) -> Result<Epoch, PgError>;

    /// Resolve once the shard is active in its current interval.
    async fn wait_for_active(&self) -> Result<(), PgError>;

    /// Whether `msg` targets a map older than the current primary's tenure.
    fn can_discard(&self, msg: &ClientMessage) -> bool;

    /// Whether this node is the shard's primary.
    fn is_primary(&self) -> bool;

    /// Whether this node holds a valid non-primary replica role.
    fn is_nonprimary(&self) -> bool;

    /// Version the object must be recovered to, if it is missing locally.
    fn missing_version(&self, object: ObjectId) -> Option<u64>;

    /// Whether some replica of the object is missing or being backfilled.
    fn is_degraded_or_backfilling(&self, object: ObjectId) -> bool;

    /// Whether the object must be recovered before it can be served.
    fn is_unreadable_or_degraded(&self, object: ObjectId) -> bool {
        self.missing_version(object).is_some() || self.is_degraded_or_backfilling(object)
    }

    /// Whether a non-primary may serve a read of the object locally.
    fn can_serve_replica_read(&self, object: ObjectId) -> bool;

    /// Result code recorded for `reqid`, if that request already completed.
    async fn already_completed(&self, reqid: RequestId) -> Result<Option<i32>, PgError>;

    /// Lock the object's context for exclusive use by one op.
    async fn acquire_locked_context(
        &self,
        object: &str,
        info: &OpInfo,
    ) -> Result<LockedContext, PgError>;

    /// Execute the message's sub-ops against a locked context.
    async fn execute(
        &self,
        msg: &ClientMessage,
        ctx: &mut LockedContext,
        info: &OpInfo,
    ) -> Result<OpReply, PgError>;

    /// Execute a placement-group-level (administrative) op.
    async fn execute_admin_op(&self, msg: &ClientMessage) -> Result<OpReply, PgError>;

    /// Called by recovery once the object is locally readable again.
    fn on_local_recover(&self, object: ObjectId);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Progress of one object recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryState {
    /// Still running.
    Pending,
    /// The object is readable again.
    Recovered,
    /// Recovery gave up.
    Failed(String),
}

/// Shared completion handle for an in-flight object recovery.
///
/// Cloning yields another handle on the same recovery; every clone resolves
/// with the same outcome.
#[derive(Debug, Clone)]
pub struct RecoveryWait {
    object: ObjectId,
    rx: watch::Receiver<RecoveryState>,
}

impl RecoveryWait {
    /// Wrap a recovery state channel.
    pub fn new(object: ObjectId, rx: watch::Receiver<RecoveryState>) -> Self {
        Self { object, rx }
    }

    /// Object being recovered.
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Whether the recovery has already resolved.
    pub fn is_resolved(&self) -> bool {
        *self.rx.borrow() != RecoveryState::Pending
    }

    /// Wait for the recovery to resolve.
    ///
    /// A recovery whose driver went away without resolving counts as failed.
    pub async fn wait(mut self) -> Result<(), PgError> {
        let outcome = match self
            .rx
            .wait_for(|state| *state != RecoveryState::Pending)
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => RecoveryState::Failed("recovery abandoned".to_string()),
        };

        match outcome {
            RecoveryState::Failed(reason) => Err(PgError::RecoveryFailed {
                object: self.object,
                reason,
            }),
            _ => Ok(()),
        }
    }
}

/// Repairs missing or degraded objects.
pub trait RecoveryBackend: Send + Sync {
    /// Whether a recovery of `object` is already registered.
    fn is_recovering(&self, object: ObjectId) -> bool;

    /// Completion handle of the registered recovery of `object`, if any.
    fn get_recovery_wait(&self, object: ObjectId) -> Option<RecoveryWait>;

    /// Register and start a recovery of `object` up to `version`.
    ///
    /// If a recovery is already registered, its handle is returned instead.
    fn start_recovery(
        &self,
        object: ObjectId,
        version: u64,
        pg: Arc<dyn PlacementGroup>,
        epoch: Epoch,
    ) -> RecoveryWait;
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A client connection replies are sent on.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Connection id.
    fn id(&self) -> ConnectionId;

    /// Send a reply. Fails with [`PgError::ConnectionClosed`] once closed.
    async fn send(&self, reply: Reply) -> Result<(), PgError>;

    /// Whether the connection has been closed.
    fn is_closed(&self) -> bool;
}
