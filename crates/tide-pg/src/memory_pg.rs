//! Scriptable in-memory placement group.
//!
//! [`MemoryPg`] keeps its objects in an [`ObcLockManager`] and implements
//! every [`PlacementGroup`] contract the request pipeline relies on. Tests
//! and the simulator drive its peering state directly: role, activation,
//! interval changes, missing and degraded objects, recorded completions,
//! injected failures and execution latency.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tide_types::{
    ClientMessage, Epoch, ObjectId, OpFlags, OpInfo, OpReply, OpResult, PgId, RequestId, SubOp,
    errno,
};
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::error::PgError;
use crate::obc::{LockedContext, ObcLockManager, ObjectState};
use crate::traits::PlacementGroup;

/// Role this node holds in a placement group's acting set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgRole {
    /// Primary: serves every op.
    Primary,
    /// Non-primary replica: may serve balanced or localized reads.
    Replica,
    /// Not in the acting set.
    Stray,
}

#[derive(Debug, Clone, Copy)]
struct PeeringState {
    map_epoch: Epoch,
    interval_start: Epoch,
    same_primary_since: Epoch,
    role: PgRole,
    active: bool,
}

/// In-memory placement group.
pub struct MemoryPg {
    id: PgId,
    peering: watch::Sender<PeeringState>,
    missing: Mutex<HashMap<ObjectId, u64>>,
    degraded: Mutex<HashSet<ObjectId>>,
    replica_unreadable: Mutex<HashSet<ObjectId>>,
    load_failures: Mutex<HashMap<String, Option<i32>>>,
    injected: Mutex<VecDeque<PgError>>,
    completed: Mutex<HashMap<RequestId, i32>>,
    executed: Mutex<Vec<RequestId>>,
    names: Mutex<BTreeSet<String>>,
    exec_delay: Mutex<Option<Duration>>,
    objects: ObcLockManager,
}

impl MemoryPg {
    /// Create an active placement group with this node as primary.
    pub fn new(id: PgId, epoch: Epoch) -> Self {
        let (peering, _) = watch::channel(PeeringState {
            map_epoch: epoch,
            interval_start: epoch,
            same_primary_since: epoch,
            role: PgRole::Primary,
            active: true,
        });
        Self {
            id,
            peering,
            missing: Mutex::default(),
            degraded: Mutex::default(),
            replica_unreadable: Mutex::default(),
            load_failures: Mutex::default(),
            injected: Mutex::default(),
            completed: Mutex::default(),
            executed: Mutex::default(),
            names: Mutex::default(),
            exec_delay: Mutex::default(),
            objects: ObcLockManager::new(),
        }
    }

    /// Builder: start with `role` instead of primary.
    pub fn with_role(self, role: PgRole) -> Self {
        self.peering.send_modify(|p| p.role = role);
        self
    }

    // -- peering ------------------------------------------------------------

    /// Current role.
    pub fn role(&self) -> PgRole {
        self.peering.borrow().role
    }

    /// Consume a newer map that does not change the acting set.
    pub fn advance_map(&self, epoch: Epoch) {
        self.peering.send_if_modified(|p| {
            if epoch > p.map_epoch {
                p.map_epoch = epoch;
                true
            } else {
                false
            }
        });
    }

    /// Mark the placement group active or inactive in its current interval.
    pub fn set_active(&self, active: bool) {
        self.peering.send_modify(|p| p.active = active);
    }

    /// Start a new interval at `epoch`: the acting set changed and this node
    /// now holds `role`. The placement group is inactive until
    /// [`set_active`](Self::set_active) is called again.
    ///
    /// `primary_changed` records whether the primary itself changed, which
    /// makes ops sent with older maps discardable.
    pub fn start_interval(&self, epoch: Epoch, role: PgRole, primary_changed: bool) {
        self.peering.send_modify(|p| {
            p.map_epoch = p.map_epoch.max(epoch);
            p.interval_start = epoch;
            if primary_changed {
                p.same_primary_since = epoch;
            }
            p.role = role;
            p.active = false;
        });
        info!(pg = %self.id, %epoch, ?role, primary_changed, "new interval");
    }

    // -- object state -------------------------------------------------------

    /// Mark an object missing locally; it must be recovered to `version`.
    pub fn mark_missing(&self, object: ObjectId, version: u64) {
        self.missing
            .lock()
            .expect("missing lock poisoned")
            .insert(object, version);
    }

    /// Mark an object degraded (a replica is missing it).
    pub fn mark_degraded(&self, object: ObjectId) {
        self.degraded
            .lock()
            .expect("degraded lock poisoned")
            .insert(object);
    }

    /// Control whether a non-primary may serve reads of `object`.
    pub fn set_replica_readable(&self, object: ObjectId, readable: bool) {
        let mut set = self
            .replica_unreadable
            .lock()
            .expect("replica lock poisoned");
        if readable {
            set.remove(&object);
        } else {
            set.insert(object);
        }
    }

    /// Make loading the context of `name` fail.
    pub fn fail_object_load(&self, name: impl Into<String>) {
        self.load_failures
            .lock()
            .expect("load failures lock poisoned")
            .insert(name.into(), None);
    }

    /// Make loading the context of `name` fail with client-visible `code`.
    pub fn reject_object_load(&self, name: impl Into<String>, code: i32) {
        self.load_failures
            .lock()
            .expect("load failures lock poisoned")
            .insert(name.into(), Some(code));
    }

    /// Make the next `execute` fail with `err` before touching the object.
    pub fn inject_execute_error(&self, err: PgError) {
        self.injected
            .lock()
            .expect("injected lock poisoned")
            .push_back(err);
    }

    /// Delay every `execute` by `delay` while holding the object lock.
    pub fn set_exec_delay(&self, delay: Option<Duration>) {
        *self.exec_delay.lock().expect("exec delay lock poisoned") = delay;
    }

    /// Record `reqid` as already completed with `result`.
    pub fn record_completed(&self, reqid: RequestId, result: i32) {
        self.completed
            .lock()
            .expect("completed lock poisoned")
            .insert(reqid, result);
    }

    /// Requests executed so far, in execution order.
    pub fn executed(&self) -> Vec<RequestId> {
        self.executed.lock().expect("executed lock poisoned").clone()
    }

    /// Highest number of simultaneous lock holders seen for one object.
    pub fn max_concurrent_lock_holders(&self) -> usize {
        self.objects.max_concurrent_holders()
    }

    /// Snapshot of a named object's state.
    pub async fn object(&self, name: &str) -> Option<ObjectState> {
        self.objects.snapshot(ObjectId::from_name(name)).await
    }

    fn ack_flags(msg: &ClientMessage) -> OpFlags {
        msg.flags & (OpFlags::ACK | OpFlags::ONDISK)
    }
}

/// Largest object body a write may produce.
pub const MAX_OBJECT_SIZE: u64 = 64 << 20;

/// Apply one sub-op to a scratch copy of the object state.
fn apply(state: &mut ObjectState, op: &SubOp) -> Result<Vec<u8>, i32> {
    match op {
        SubOp::Read { offset, length } => {
            if !state.exists {
                return Err(-errno::ENOENT);
            }
            let end = match *length {
                0 => u64::MAX,
                len => offset.checked_add(len).ok_or(-errno::EINVAL)?,
            };
            let size = state.data.len() as u64;
            let start = (*offset).min(size) as usize;
            let end = end.min(size) as usize;
            Ok(state.data[start..end].to_vec())
        }
        SubOp::Stat => {
            if !state.exists {
                return Err(-errno::ENOENT);
            }
            Ok((state.data.len() as u64).to_le_bytes().to_vec())
        }
        SubOp::GetXattr { name } => {
            if !state.exists {
                return Err(-errno::ENOENT);
            }
            state.xattrs.get(name).cloned().ok_or(-errno::ENODATA)
        }
        SubOp::Create { exclusive } => {
            if state.exists && *exclusive {
                return Err(-errno::EEXIST);
            }
            state.exists = true;
            Ok(Vec::new())
        }
        SubOp::Write { offset, data } => {
            let end = offset
                .checked_add(data.len() as u64)
                .ok_or(-errno::EINVAL)?;
            if end > MAX_OBJECT_SIZE {
                return Err(-errno::EFBIG);
            }
            let (offset, end) = (*offset as usize, end as usize);
            if state.data.len() < end {
                state.data.resize(end, 0);
            }
            state.data[offset..end].copy_from_slice(data);
            state.exists = true;
            Ok(Vec::new())
        }
        SubOp::WriteFull { data } => {
            if data.len() as u64 > MAX_OBJECT_SIZE {
                return Err(-errno::EFBIG);
            }
            state.data = data.clone();
            state.exists = true;
            Ok(Vec::new())
        }
        SubOp::SetXattr { name, value } => {
            state.xattrs.insert(name.clone(), value.clone());
            state.exists = true;
            Ok(Vec::new())
        }
        SubOp::Delete => {
            if !state.exists {
                return Err(-errno::ENOENT);
            }
            state.data.clear();
            state.xattrs.clear();
            state.exists = false;
            Ok(Vec::new())
        }
        // No cache tier in front of this pool.
        SubOp::CacheFlush | SubOp::CacheEvict => Err(-errno::EINVAL),
        SubOp::PgList { .. } => Err(-errno::EINVAL),
    }
}

#[async_trait::async_trait]
impl PlacementGroup for MemoryPg {
    fn id(&self) -> PgId {
        self.id
    }

    fn map_epoch(&self) -> Epoch {
        self.peering.borrow().map_epoch
    }

    fn interval_start_epoch(&self) -> Epoch {
        self.peering.borrow().interval_start
    }

    async fn wait_for_epoch(&self, min: Epoch) -> Result<Epoch, PgError> {
        let mut rx = self.peering.subscribe();
        let state = rx
            .wait_for(|p| p.map_epoch >= min)
            .await
            .map_err(|_| PgError::ShuttingDown)?;
        Ok(state.map_epoch)
    }

    async fn wait_for_active(&self) -> Result<(), PgError> {
        let mut rx = self.peering.subscribe();
        let interval = rx.borrow().interval_start;
        let state = *rx
            .wait_for(|p| p.active || p.interval_start != interval)
            .await
            .map_err(|_| PgError::ShuttingDown)?;

        if state.interval_start != interval {
            return Err(PgError::ActingSetChanged {
                is_primary: state.role == PgRole::Primary,
            });
        }
        Ok(())
    }

    fn can_discard(&self, msg: &ClientMessage) -> bool {
        msg.map_epoch < self.peering.borrow().same_primary_since
    }

    fn is_primary(&self) -> bool {
        self.role() == PgRole::Primary
    }

    fn is_nonprimary(&self) -> bool {
        self.role() == PgRole::Replica
    }

    fn missing_version(&self, object: ObjectId) -> Option<u64> {
        self.missing
            .lock()
            .expect("missing lock poisoned")
            .get(&object)
            .copied()
    }

    fn is_degraded_or_backfilling(&self, object: ObjectId) -> bool {
        self.degraded
            .lock()
            .expect("degraded lock poisoned")
            .contains(&object)
    }

    fn can_serve_replica_read(&self, object: ObjectId) -> bool {
        self.missing_version(object).is_none()
            && !self
                .replica_unreadable
                .lock()
                .expect("replica lock poisoned")
                .contains(&object)
    }

    async fn already_completed(&self, reqid: RequestId) -> Result<Option<i32>, PgError> {
        Ok(self
            .completed
            .lock()
            .expect("completed lock poisoned")
            .get(&reqid)
            .copied())
    }

    async fn acquire_locked_context(
        &self,
        object: &str,
        info: &OpInfo,
    ) -> Result<LockedContext, PgError> {
        let failure = self
            .load_failures
            .lock()
            .expect("load failures lock poisoned")
            .get(object)
            .copied();
        match failure {
            Some(Some(code)) => return Err(PgError::Client(code)),
            Some(None) => {
                return Err(PgError::ObjectLoad(format!(
                    "{object}: object info attribute is corrupt"
                )));
            }
            None => {}
        }
        trace!(pg = %self.id, object, write = info.may_write(), "locking object context");
        Ok(self.objects.lock(ObjectId::from_name(object)).await)
    }

    async fn execute(
        &self,
        msg: &ClientMessage,
        ctx: &mut LockedContext,
        info: &OpInfo,
    ) -> Result<OpReply, PgError> {
        let injected = self
            .injected
            .lock()
            .expect("injected lock poisoned")
            .pop_front();
        if let Some(err) = injected {
            debug!(pg = %self.id, %msg, error = %err, "injected execution failure");
            return Err(err);
        }

        let interval = self.interval_start_epoch();
        let delay = *self.exec_delay.lock().expect("exec delay lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let peering = *self.peering.borrow();
        if peering.interval_start != interval {
            return Err(PgError::ActingSetChanged {
                is_primary: peering.role == PgRole::Primary,
            });
        }

        let mut scratch = ctx.state().clone();
        let mut results = Vec::with_capacity(msg.ops().len());
        for op in msg.ops() {
            match apply(&mut scratch, op) {
                Ok(out) => results.push(OpResult { rval: 0, out }),
                Err(code) => {
                    debug!(pg = %self.id, %msg, %op, code, "sub-op failed");
                    return Err(PgError::Client(code));
                }
            }
        }

        if info.may_write() {
            scratch.version += 1;
            let mut names = self.names.lock().expect("names lock poisoned");
            if scratch.exists {
                names.insert(msg.object.clone());
            } else {
                names.remove(&msg.object);
            }
            drop(names);
            *ctx.state_mut() = scratch;
            self.record_completed(msg.reqid, 0);
        }
        self.executed
            .lock()
            .expect("executed lock poisoned")
            .push(msg.reqid);

        Ok(OpReply::with_results(
            msg,
            0,
            peering.map_epoch,
            Self::ack_flags(msg),
            results,
        ))
    }

    async fn execute_admin_op(&self, msg: &ClientMessage) -> Result<OpReply, PgError> {
        let names = self.names.lock().expect("names lock poisoned").clone();
        let mut results = Vec::with_capacity(msg.ops().len());
        for op in msg.ops() {
            let SubOp::PgList { max_entries } = op else {
                return Err(PgError::Client(-errno::EINVAL));
            };
            let listing: Vec<&str> = names
                .iter()
                .take(*max_entries as usize)
                .map(String::as_str)
                .collect();
            results.push(OpResult {
                rval: 0,
                out: listing.join("\n").into_bytes(),
            });
        }
        self.executed
            .lock()
            .expect("executed lock poisoned")
            .push(msg.reqid);
        Ok(OpReply::with_results(
            msg,
            0,
            self.map_epoch(),
            Self::ack_flags(msg),
            results,
        ))
    }

    fn on_local_recover(&self, object: ObjectId) {
        self.missing
            .lock()
            .expect("missing lock poisoned")
            .remove(&object);
        self.degraded
            .lock()
            .expect("degraded lock poisoned")
            .remove(&object);
    }
}
