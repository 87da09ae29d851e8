//! The per-op state machine.
//!
//! A [`ClientRequest`] threads one client message through the connection
//! gate, its sequencer slot, the shard gate, recovery, object locking and
//! execution. Each attempt runs until it produces an outcome or a
//! [`RequestError`]; errors are classified into a [`Flow`] that either
//! restarts admission (same slot, same id) or abandons the request.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tide_pg::{Connection, PgError, PlacementGroup};
use tide_types::events::{RequestFinished, RequestOutcome, RequestRestarted, SequencerAborted};
use tide_types::{ClientMessage, OpFlags, OpId, OpInfo, OpReply, Reply, errno};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::checks;
use crate::error::{GateError, RequestError, SequencerError};
use crate::gate::{Checkpoint, Gate, GateHandle};
use crate::sequencer::OpSequencer;
use crate::service::PipelineContext;

/// Where a request currently is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestState {
    /// Constructed, not started.
    Init,
    /// Waiting for the node map.
    AwaitingMap,
    /// Waiting for the placement group to be resolvable.
    ResolvingShard,
    /// Waiting for the sequencer to admit it.
    SequencedAdmission,
    /// Stale; only a map advisory is sent.
    Discarded,
    /// Waiting for the placement group's map.
    AwaitingShardMap,
    /// Waiting for the placement group to become active.
    AwaitingActivation,
    /// Decoding and routing.
    Dispatching,
    /// Running a placement-group-level op.
    PgOpPath,
    /// Running an object op.
    ObjectOpPath,
    /// Waiting for the object to be recovered.
    AwaitingRecovery,
    /// Waiting for the object context lock.
    AcquiringObjectLock,
    /// Executing against the locked object.
    Executing,
    /// Sending the reply.
    Replying,
    /// Going back to admission after an acting set change.
    RestartAdmission,
    /// Finished.
    Done,
    /// Abandoned.
    Aborted,
}

/// What the state machine does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Go back to admission, keeping the ordering slot.
    RestartAdmission,
    /// Give up with the given outcome.
    Abort(RequestOutcome),
}

/// One client op in flight.
pub struct ClientRequest {
    id: OpId,
    prev_id: OpId,
    conn: Arc<dyn Connection>,
    msg: ClientMessage,
    sequencer: Arc<OpSequencer>,
    conn_gate: Arc<Gate>,
    ctx: Arc<PipelineContext>,
    restarts: u32,
}

impl ClientRequest {
    /// Create a request and reserve its slot on `sequencer`.
    pub(crate) fn new(
        id: OpId,
        conn: Arc<dyn Connection>,
        msg: ClientMessage,
        sequencer: Arc<OpSequencer>,
        conn_gate: Arc<Gate>,
        ctx: Arc<PipelineContext>,
    ) -> Self {
        let prev_id = sequencer.reserve(id);
        ctx.tracker
            .register(id, msg.to_string(), conn.id(), msg.pgid);
        Self {
            id,
            prev_id,
            conn,
            msg,
            sequencer,
            conn_gate,
            ctx,
            restarts: 0,
        }
    }

    /// Node-local op id.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Id of the op this one is ordered after.
    pub fn prev_id(&self) -> OpId {
        self.prev_id
    }

    /// Drive the request to completion.
    #[tracing::instrument(name = "client_request", skip(self), fields(op = %self.id, pg = %self.msg.pgid))]
    pub async fn run(mut self) -> RequestOutcome {
        let mut shutdown = self.ctx.shutdown.clone();
        let outcome = loop {
            if *shutdown.borrow() {
                break RequestOutcome::ShutDown;
            }

            let result: Result<RequestOutcome, RequestError> = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => Err(PgError::ShuttingDown.into()),
                result = self.attempt() => result,
            };

            match result {
                Ok(outcome) => break outcome,
                Err(e) => match self.classify(e) {
                    Flow::RestartAdmission => continue,
                    Flow::Abort(outcome) => break outcome,
                },
            }
        };

        let terminal = match outcome {
            RequestOutcome::Aborted | RequestOutcome::ShutDown => RequestState::Aborted,
            _ => RequestState::Done,
        };
        self.set_state(terminal);
        debug!(op = %self, ?outcome, "request finished");
        self.ctx.events.emit(RequestFinished {
            op_id: self.id,
            reqid: self.msg.reqid,
            pgid: self.msg.pgid,
            outcome,
        });
        outcome
    }

    fn classify(&mut self, err: RequestError) -> Flow {
        if self.ctx.is_shutting_down() {
            trace!(op = %self, error = %err, "abandoned on shutdown");
            return Flow::Abort(RequestOutcome::ShutDown);
        }

        match err {
            RequestError::Pg(PgError::ActingSetChanged { is_primary: true }) => {
                self.restarts += 1;
                debug!(op = %self, restarts = self.restarts, "acting set changed, restarting");
                self.sequencer.maybe_reset(self.id);
                self.set_state(RequestState::RestartAdmission);
                self.ctx.tracker.note_restart(self.id);
                self.ctx.events.emit(RequestRestarted {
                    op_id: self.id,
                    pgid: self.msg.pgid,
                    restarts: self.restarts,
                });
                Flow::RestartAdmission
            }
            RequestError::Pg(PgError::ActingSetChanged { is_primary: false }) => {
                debug!(op = %self, "no longer primary, abandoning");
                self.abort_sequencer();
                Flow::Abort(RequestOutcome::Aborted)
            }
            RequestError::Pg(PgError::ShuttingDown) => Flow::Abort(RequestOutcome::ShutDown),
            RequestError::Sequencer(SequencerError::Aborted) => {
                debug!(op = %self, "sequencer aborted, abandoning");
                Flow::Abort(RequestOutcome::Aborted)
            }
            RequestError::Gate(GateError::Closed) => {
                debug!(op = %self, "gate closed, abandoning");
                self.abort_sequencer();
                Flow::Abort(RequestOutcome::Aborted)
            }
            err => {
                warn!(op = %self, error = %err, "request failed outside its sequencer slot");
                self.abort_sequencer();
                Flow::Abort(RequestOutcome::Failed)
            }
        }
    }

    fn abort_sequencer(&self) {
        if self.sequencer.is_aborted() {
            return;
        }
        self.sequencer.abort();
        self.ctx.events.emit(SequencerAborted {
            connection: self.conn.id(),
            pgid: self.msg.pgid,
        });
    }

    // -- attempt ------------------------------------------------------------

    async fn attempt(&self) -> Result<RequestOutcome, RequestError> {
        let mut handle = GateHandle::new(self.id);

        self.set_state(RequestState::AwaitingMap);
        handle.enter(&self.conn_gate, Checkpoint::AwaitingMap).await?;
        self.ctx.map.wait_for_epoch(self.msg.min_epoch).await?;
        handle.exit(Checkpoint::AwaitingMap)?;

        self.set_state(RequestState::ResolvingShard);
        handle
            .enter(&self.conn_gate, Checkpoint::ResolvingShard)
            .await?;
        let pg = self.ctx.registry.resolve_shard(self.msg.pgid).await?;
        handle.exit(Checkpoint::ResolvingShard)?;
        debug!(
            op = %self,
            same_interval_since = %pg.interval_start_epoch(),
            "placement group resolved"
        );

        self.set_state(RequestState::SequencedAdmission);
        self.sequencer
            .start_op(handle, self.prev_id, self.id, |handle| self.process(pg, handle))
            .await
    }

    /// Body run inside the sequencer slot. Anything but a control signal
    /// still finishes the slot so later ops are not held up.
    async fn process(
        &self,
        pg: Arc<dyn PlacementGroup>,
        handle: GateHandle,
    ) -> Result<RequestOutcome, RequestError> {
        let outcome = match self.dispatch(&pg, handle).await {
            Ok(outcome) => outcome,
            Err(e) if is_control(&e) => return Err(e),
            Err(e) => {
                warn!(op = %self, error = %e, "request failed");
                RequestOutcome::Failed
            }
        };
        self.sequencer.finish_op(self.id);
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        pg: &Arc<dyn PlacementGroup>,
        mut handle: GateHandle,
    ) -> Result<RequestOutcome, RequestError> {
        if pg.can_discard(&self.msg) {
            self.set_state(RequestState::Discarded);
            debug!(op = %self, pg_epoch = %pg.map_epoch(), "stale op discarded, sending map advisory");
            self.send(Reply::MapAdvisory {
                reqid: self.msg.reqid,
                requested: self.msg.map_epoch,
                current: self.ctx.map.current_epoch(),
            })
            .await;
            return Ok(RequestOutcome::Discarded);
        }

        let gate = self.ctx.shard_gate(pg.id());

        self.set_state(RequestState::AwaitingShardMap);
        handle.enter(&gate, Checkpoint::AwaitingShardMap).await?;
        pg.wait_for_epoch(self.msg.min_epoch).await?;
        handle.exit(Checkpoint::AwaitingShardMap)?;

        self.set_state(RequestState::AwaitingActivation);
        handle.enter(&gate, Checkpoint::AwaitingActivation).await?;
        pg.wait_for_active().await?;
        handle.exit(Checkpoint::AwaitingActivation)?;

        self.set_state(RequestState::Dispatching);
        let msg = self.decoded()?;
        if msg.is_pg_op() {
            self.set_state(RequestState::PgOpPath);
            self.process_pg_op(pg, &msg).await
        } else {
            self.set_state(RequestState::ObjectOpPath);
            self.process_op(pg, &msg, &gate, handle).await
        }
    }

    fn decoded(&self) -> Result<Cow<'_, ClientMessage>, PgError> {
        if self.msg.is_decoded() {
            return Ok(Cow::Borrowed(&self.msg));
        }
        let mut msg = self.msg.clone();
        msg.finish_decode()?;
        trace!(op = %self, ops = msg.ops().len(), "payload decoded");
        Ok(Cow::Owned(msg))
    }

    async fn process_pg_op(
        &self,
        pg: &Arc<dyn PlacementGroup>,
        msg: &ClientMessage,
    ) -> Result<RequestOutcome, RequestError> {
        let reply = match pg.execute_admin_op(msg).await {
            Ok(reply) => reply,
            Err(PgError::Client(code)) => error_reply(msg, pg.as_ref(), code),
            Err(e) => return Err(e.into()),
        };
        self.set_state(RequestState::Replying);
        self.send(Reply::Op(reply)).await;
        Ok(RequestOutcome::Replied)
    }

    async fn process_op(
        &self,
        pg: &Arc<dyn PlacementGroup>,
        msg: &ClientMessage,
        gate: &Arc<Gate>,
        mut handle: GateHandle,
    ) -> Result<RequestOutcome, RequestError> {
        let object = msg.object_id();
        loop {
            self.set_state(RequestState::AwaitingRecovery);
            handle.enter(gate, Checkpoint::AwaitingRecovery).await?;
            match self.ctx.recovery.ensure_readable(pg, object).await {
                Ok(()) => {}
                Err(PgError::RecoveryFailed { reason, .. }) => {
                    handle.exit(Checkpoint::AwaitingRecovery)?;
                    info!(op = %self, %reason, "object unrecoverable, failing op");
                    self.set_state(RequestState::Replying);
                    self.send(Reply::Op(error_reply(msg, pg.as_ref(), -errno::EIO)))
                        .await;
                    return Ok(RequestOutcome::Replied);
                }
                Err(e) => return Err(e.into()),
            }
            handle.exit(Checkpoint::AwaitingRecovery)?;

            let completed = match pg.already_completed(msg.reqid).await {
                Ok(completed) => completed,
                Err(PgError::Client(code)) => return self.reply_error(pg, msg, code).await,
                Err(e) => return Err(e.into()),
            };
            if let Some(result) = completed {
                debug!(op = %self, result, "already completed, replaying result");
                self.set_state(RequestState::Replying);
                self.send(Reply::Op(checks::completed_reply(msg, pg.as_ref(), result)))
                    .await;
                return Ok(RequestOutcome::Deduplicated);
            }

            let info = OpInfo::from_ops(msg.ops());

            self.set_state(RequestState::AcquiringObjectLock);
            handle.enter(gate, Checkpoint::AcquiringObjectLock).await?;
            let mut locked = match pg.acquire_locked_context(&msg.object, &info).await {
                Ok(locked) => locked,
                Err(PgError::Client(code)) => {
                    handle.exit(Checkpoint::AcquiringObjectLock)?;
                    return self.reply_error(pg, msg, code).await;
                }
                Err(e) => return Err(e.into()),
            };
            handle.exit(Checkpoint::AcquiringObjectLock)?;

            self.set_state(RequestState::Executing);
            handle.enter(gate, Checkpoint::Executing).await?;

            if !pg.is_primary() {
                if checks::is_misdirected(msg, &info, pg.as_ref()) {
                    debug!(op = %self, "misdirected op dropped");
                    return Ok(RequestOutcome::Dropped);
                }
                if !pg.can_serve_replica_read(object) {
                    debug!(op = %self, "replica cannot serve read, asking client to retry");
                    handle.exit(Checkpoint::Executing)?;
                    self.set_state(RequestState::Replying);
                    self.send(Reply::Op(checks::eagain_reply(msg, pg.as_ref())))
                        .await;
                    return Ok(RequestOutcome::Rejected);
                }
            }

            let reply = match pg.execute(msg, &mut locked, &info).await {
                Ok(reply) => reply,
                Err(PgError::Eagain) => {
                    debug!(op = %self, "execution asked for retry");
                    drop(locked);
                    handle.rewind();
                    continue;
                }
                Err(PgError::Client(code)) => error_reply(msg, pg.as_ref(), code),
                Err(e) => return Err(e.into()),
            };
            handle.exit(Checkpoint::Executing)?;

            self.set_state(RequestState::Replying);
            self.send(Reply::Op(reply)).await;
            drop(locked);
            return Ok(RequestOutcome::Replied);
        }
    }

    async fn reply_error(
        &self,
        pg: &Arc<dyn PlacementGroup>,
        msg: &ClientMessage,
        code: i32,
    ) -> Result<RequestOutcome, RequestError> {
        debug!(op = %self, code, "replying with client-visible error");
        self.set_state(RequestState::Replying);
        self.send(Reply::Op(error_reply(msg, pg.as_ref(), code))).await;
        Ok(RequestOutcome::Replied)
    }

    async fn send(&self, reply: Reply) {
        if let Err(e) = self.conn.send(reply).await {
            debug!(op = %self, error = %e, "reply not delivered");
        }
    }

    fn set_state(&self, state: RequestState) {
        self.ctx.tracker.set_state(self.id, state);
    }
}

impl Drop for ClientRequest {
    fn drop(&mut self) {
        self.ctx.tracker.remove(self.id);
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.msg)
    }
}

/// Signals the state machine acts on rather than reports.
fn is_control(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Pg(PgError::ActingSetChanged { .. } | PgError::ShuttingDown)
            | RequestError::Gate(GateError::Closed)
            | RequestError::Sequencer(SequencerError::Aborted)
    )
}

/// Reply carrying a client-visible error code.
fn error_reply(msg: &ClientMessage, pg: &dyn PlacementGroup, code: i32) -> OpReply {
    OpReply::new(
        msg,
        code,
        pg.map_epoch(),
        OpFlags::ACK | OpFlags::ONDISK,
        !msg.has_flag(OpFlags::RETURNVEC),
    )
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the service is gone: treat it as shutdown.
    let _ = rx.wait_for(|down| *down).await;
}
