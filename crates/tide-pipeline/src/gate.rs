//! Ordered pipeline checkpoints with FIFO admission.
//!
//! A [`Gate`] owns one exclusive stage per [`Checkpoint`] of its scope. At
//! most one op holds a stage at a time; the others queue in arrival order.
//! Ops move through checkpoints with a [`GateHandle`], which enforces the
//! checkpoint order and releases whatever it holds when dropped.
//!
//! Two gates exist per request: the connection gate (map catch-up, shard
//! resolution) and the shard gate (everything after admission).

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tide_types::OpId;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::GateError;

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Which gate a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GateScope {
    /// Per client connection.
    Connection,
    /// Per placement group.
    Shard,
}

impl fmt::Display for GateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateScope::Connection => f.write_str("connection"),
            GateScope::Shard => f.write_str("shard"),
        }
    }
}

/// Named pipeline checkpoints, in the order an op passes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Checkpoint {
    /// Waiting for the node map to reach the op's minimum epoch.
    AwaitingMap,
    /// Waiting for the target placement group to be resolvable.
    ResolvingShard,
    /// Waiting for the placement group to consume the required map.
    AwaitingShardMap,
    /// Waiting for the placement group to become active.
    AwaitingActivation,
    /// Waiting for the target object to be recovered.
    AwaitingRecovery,
    /// Waiting for the object context lock.
    AcquiringObjectLock,
    /// Executing against the locked object.
    Executing,
}

impl Checkpoint {
    /// Checkpoints of the connection gate, in order.
    pub const CONNECTION: [Checkpoint; 2] =
        [Checkpoint::AwaitingMap, Checkpoint::ResolvingShard];

    /// Checkpoints of the shard gate, in order.
    pub const SHARD: [Checkpoint; 5] = [
        Checkpoint::AwaitingShardMap,
        Checkpoint::AwaitingActivation,
        Checkpoint::AwaitingRecovery,
        Checkpoint::AcquiringObjectLock,
        Checkpoint::Executing,
    ];

    /// Gate this checkpoint belongs to.
    pub fn scope(self) -> GateScope {
        match self {
            Checkpoint::AwaitingMap | Checkpoint::ResolvingShard => GateScope::Connection,
            _ => GateScope::Shard,
        }
    }

    /// Position of the checkpoint within its gate.
    fn slot(self) -> usize {
        match self {
            Checkpoint::AwaitingMap | Checkpoint::AwaitingShardMap => 0,
            Checkpoint::ResolvingShard | Checkpoint::AwaitingActivation => 1,
            Checkpoint::AwaitingRecovery => 2,
            Checkpoint::AcquiringObjectLock => 3,
            Checkpoint::Executing => 4,
        }
    }

    /// Human-readable name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Checkpoint::AwaitingMap => "awaiting-map",
            Checkpoint::ResolvingShard => "resolving-shard",
            Checkpoint::AwaitingShardMap => "awaiting-shard-map",
            Checkpoint::AwaitingActivation => "awaiting-activation",
            Checkpoint::AwaitingRecovery => "awaiting-recovery",
            Checkpoint::AcquiringObjectLock => "acquiring-object-lock",
            Checkpoint::Executing => "executing",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Stage {
    held: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct GateInner {
    stages: Vec<Stage>,
    closed: bool,
}

/// A set of exclusive, FIFO-ordered checkpoints.
pub struct Gate {
    scope: GateScope,
    name: String,
    inner: Mutex<GateInner>,
}

impl Gate {
    /// Create an open gate for `scope`. `name` shows up in traces.
    pub fn new(scope: GateScope, name: impl Into<String>) -> Self {
        let stages = match scope {
            GateScope::Connection => Checkpoint::CONNECTION.len(),
            GateScope::Shard => Checkpoint::SHARD.len(),
        };
        Self {
            scope,
            name: name.into(),
            inner: Mutex::new(GateInner {
                stages: (0..stages).map(|_| Stage::default()).collect(),
                closed: false,
            }),
        }
    }

    /// The gate's scope.
    pub fn scope(&self) -> GateScope {
        self.scope
    }

    /// The gate's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel every queued waiter and refuse future entries.
    ///
    /// Current holders keep their stage until they exit it.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        if inner.closed {
            return;
        }
        inner.closed = true;
        let mut cancelled = 0;
        for stage in &mut inner.stages {
            cancelled += stage.waiters.len();
            stage.waiters.clear();
        }
        trace!(gate = %self.name, cancelled, "gate closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("gate lock poisoned").closed
    }

    /// Whether some op currently holds `checkpoint`.
    pub fn is_held(&self, checkpoint: Checkpoint) -> bool {
        let inner = self.inner.lock().expect("gate lock poisoned");
        inner.stages[checkpoint.slot()].held
    }

    /// Number of ops queued behind the holder of `checkpoint`.
    pub fn queued(&self, checkpoint: Checkpoint) -> usize {
        let inner = self.inner.lock().expect("gate lock poisoned");
        inner.stages[checkpoint.slot()].waiters.len()
    }

    async fn acquire(&self, op: OpId, checkpoint: Checkpoint) -> Result<(), GateError> {
        let rx = {
            let mut inner = self.inner.lock().expect("gate lock poisoned");
            if inner.closed {
                return Err(GateError::Closed);
            }
            let stage = &mut inner.stages[checkpoint.slot()];
            if !stage.held {
                stage.held = true;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            stage.waiters.push_back(tx);
            trace!(%op, gate = %self.name, %checkpoint, position = stage.waiters.len(), "queued");
            rx
        };

        Waiter {
            gate: self,
            checkpoint,
            rx,
            resolved: false,
        }
        .wait()
        .await
    }

    /// Hand `checkpoint` to the next live waiter, or mark it free.
    fn release(&self, checkpoint: Checkpoint) {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        let stage = &mut inner.stages[checkpoint.slot()];
        while let Some(tx) = stage.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        stage.held = false;
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("scope", &self.scope)
            .field("name", &self.name)
            .finish()
    }
}

/// A queued entry. If dropped after ownership was handed to it, passes the
/// stage on so a cancelled op never wedges the queue.
struct Waiter<'a> {
    gate: &'a Gate,
    checkpoint: Checkpoint,
    rx: oneshot::Receiver<()>,
    resolved: bool,
}

impl Waiter<'_> {
    async fn wait(mut self) -> Result<(), GateError> {
        let result = (&mut self.rx).await.map_err(|_| GateError::Closed);
        self.resolved = true;
        result
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.gate.release(self.checkpoint);
        }
    }
}

// ---------------------------------------------------------------------------
// GateHandle
// ---------------------------------------------------------------------------

/// Per-op token tracking the checkpoint currently held.
///
/// Checkpoints must be entered in increasing order and the held one must be
/// exited before the next is entered. Dropping the handle exits whatever it
/// holds.
pub struct GateHandle {
    op: OpId,
    held: Option<(Arc<Gate>, Checkpoint)>,
    reached: Option<Checkpoint>,
}

impl GateHandle {
    /// Create an empty handle for `op`.
    pub fn new(op: OpId) -> Self {
        Self {
            op,
            held: None,
            reached: None,
        }
    }

    /// Checkpoint currently held, if any.
    pub fn held(&self) -> Option<Checkpoint> {
        self.held.as_ref().map(|(_, checkpoint)| *checkpoint)
    }

    /// Furthest checkpoint entered since creation or the last rewind.
    pub fn reached(&self) -> Option<Checkpoint> {
        self.reached
    }

    /// Wait for `checkpoint` on `gate` in FIFO order.
    pub async fn enter(
        &mut self,
        gate: &Arc<Gate>,
        checkpoint: Checkpoint,
    ) -> Result<(), GateError> {
        if let Some(held) = self.held() {
            return Err(GateError::StillHeld {
                op: self.op,
                held,
                requested: checkpoint,
            });
        }
        if checkpoint.scope() != gate.scope() {
            return Err(GateError::WrongScope {
                checkpoint,
                scope: gate.scope(),
            });
        }
        if let Some(reached) = self.reached.filter(|reached| checkpoint <= *reached) {
            return Err(GateError::OutOfOrder {
                op: self.op,
                reached,
                requested: checkpoint,
            });
        }

        gate.acquire(self.op, checkpoint).await?;
        trace!(op = %self.op, gate = %gate.name(), %checkpoint, "entered");
        self.held = Some((gate.clone(), checkpoint));
        self.reached = Some(checkpoint);
        Ok(())
    }

    /// Leave `checkpoint`, admitting the next op queued on it.
    pub fn exit(&mut self, checkpoint: Checkpoint) -> Result<(), GateError> {
        match self.held.take() {
            Some((gate, held)) if held == checkpoint => {
                gate.release(held);
                Ok(())
            }
            other => {
                self.held = other;
                Err(GateError::NotHeld {
                    op: self.op,
                    checkpoint,
                })
            }
        }
    }

    /// Exit whatever is held and forget progress, so the op can loop back to
    /// an earlier checkpoint.
    pub fn rewind(&mut self) {
        if let Some((gate, held)) = self.held.take() {
            gate.release(held);
        }
        self.reached = None;
    }
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        if let Some((gate, held)) = self.held.take() {
            trace!(op = %self.op, gate = %gate.name(), checkpoint = %held, "released on drop");
            gate.release(held);
        }
    }
}

impl fmt::Debug for GateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateHandle")
            .field("op", &self.op)
            .field("held", &self.held())
            .field("reached", &self.reached)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
