//! Entry point for decoded client messages.
//!
//! The transport hands every decoded message to [`OpService::submit`], which
//! wraps it in a [`ClientRequest`], reserves its ordering slot and spawns it.
//! The service owns the per-connection state (connection gate and
//! sequencers), the per-shard gates and the node-wide shutdown signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tide_pg::{Connection, MapGate, PgError, PgRegistry, RecoveryBackend};
use tide_types::events::{EventBus, RequestOutcome, SequencerAborted};
use tide_types::{ClientMessage, ConnectionId, OpId, PgId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RequestError;
use crate::gate::{Gate, GateScope};
use crate::recovery::RecoveryTrigger;
use crate::request::ClientRequest;
use crate::sequencer::OpSequencer;
use crate::tracker::OpTracker;

/// Node-wide collaborators shared by every request.
pub(crate) struct PipelineContext {
    pub(crate) map: Arc<dyn MapGate>,
    pub(crate) registry: Arc<dyn PgRegistry>,
    pub(crate) recovery: RecoveryTrigger,
    pub(crate) tracker: Arc<OpTracker>,
    pub(crate) events: EventBus,
    pub(crate) shutdown: watch::Receiver<bool>,
    shard_gates: Mutex<HashMap<PgId, Arc<Gate>>>,
}

impl PipelineContext {
    /// The gate of placement group `pgid`, created on first use.
    pub(crate) fn shard_gate(&self, pgid: PgId) -> Arc<Gate> {
        self.shard_gates
            .lock()
            .expect("shard gates lock poisoned")
            .entry(pgid)
            .or_insert_with(|| Arc::new(Gate::new(GateScope::Shard, pgid.to_string())))
            .clone()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Per-connection pipeline state.
pub struct ConnectionState {
    id: ConnectionId,
    gate: Arc<Gate>,
    sequencers: Mutex<HashMap<PgId, Arc<OpSequencer>>>,
}

impl ConnectionState {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            gate: Arc::new(Gate::new(GateScope::Connection, id.to_string())),
            sequencers: Mutex::new(HashMap::new()),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Connection-scoped gate.
    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    /// The sequencer for `pgid`, created on first use.
    ///
    /// An aborted sequencer is replaced so requests arriving after the abort
    /// start a fresh ordering chain.
    pub fn sequencer_for(&self, pgid: PgId) -> Arc<OpSequencer> {
        let mut sequencers = self.sequencers.lock().expect("sequencers lock poisoned");
        let entry = sequencers
            .entry(pgid)
            .or_insert_with(|| Arc::new(OpSequencer::new()));
        if entry.is_aborted() {
            debug!(conn = %self.id, pg = %pgid, "replacing aborted sequencer");
            *entry = Arc::new(OpSequencer::new());
        }
        entry.clone()
    }

    /// The existing sequencer for `pgid`, if any.
    pub fn sequencer(&self, pgid: PgId) -> Option<Arc<OpSequencer>> {
        self.sequencers
            .lock()
            .expect("sequencers lock poisoned")
            .get(&pgid)
            .cloned()
    }

    fn remove_sequencer(&self, pgid: PgId) -> Option<Arc<OpSequencer>> {
        self.sequencers
            .lock()
            .expect("sequencers lock poisoned")
            .remove(&pgid)
    }

    fn drain_sequencers(&self) -> Vec<(PgId, Arc<OpSequencer>)> {
        self.sequencers
            .lock()
            .expect("sequencers lock poisoned")
            .drain()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// OpService
// ---------------------------------------------------------------------------

/// Admits client messages into the request pipeline.
pub struct OpService {
    ctx: Arc<PipelineContext>,
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionState>>>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl OpService {
    /// Create a service over the node's collaborators.
    pub fn new(
        map: Arc<dyn MapGate>,
        registry: Arc<dyn PgRegistry>,
        recovery: Arc<dyn RecoveryBackend>,
        events: EventBus,
    ) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            ctx: Arc::new(PipelineContext {
                map,
                registry,
                recovery: RecoveryTrigger::new(recovery, events.clone()),
                tracker: Arc::new(OpTracker::new()),
                events,
                shutdown,
                shard_gates: Mutex::new(HashMap::new()),
            }),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Admit a decoded message received on `conn`.
    ///
    /// The request's ordering slot is reserved before this returns, so
    /// messages submitted in order on one connection complete in order.
    /// The returned handle resolves with the request's outcome; callers may
    /// drop it.
    pub fn submit(
        &self,
        conn: Arc<dyn Connection>,
        msg: ClientMessage,
    ) -> Result<JoinHandle<RequestOutcome>, RequestError> {
        if self.is_shutting_down() {
            warn!(conn = %conn.id(), %msg, "refusing request, shutting down");
            return Err(PgError::ShuttingDown.into());
        }

        let state = self.connection_state(conn.id());
        let sequencer = state.sequencer_for(msg.pgid);
        let id = OpId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = ClientRequest::new(
            id,
            conn,
            msg,
            sequencer,
            state.gate.clone(),
            self.ctx.clone(),
        );
        debug!(op = %request, "submitted");
        Ok(tokio::spawn(request.run()))
    }

    /// Tear down the state of a closed connection.
    ///
    /// Its queued requests are cancelled and its sequencers aborted.
    pub fn connection_closed(&self, id: ConnectionId) {
        let Some(state) = self
            .connections
            .lock()
            .expect("connections lock poisoned")
            .remove(&id)
        else {
            return;
        };
        state.gate.close();
        for (pgid, sequencer) in state.drain_sequencers() {
            sequencer.abort();
            self.ctx.events.emit(SequencerAborted {
                connection: id,
                pgid,
            });
        }
        info!(conn = %id, "connection state dropped");
    }

    /// Forget every sequencer and the gate of a removed placement group.
    pub fn forget_pg(&self, pgid: PgId) {
        let states: Vec<Arc<ConnectionState>> = self
            .connections
            .lock()
            .expect("connections lock poisoned")
            .values()
            .cloned()
            .collect();
        for state in states {
            if let Some(sequencer) = state.remove_sequencer(pgid) {
                sequencer.abort();
                self.ctx.events.emit(SequencerAborted {
                    connection: state.id,
                    pgid,
                });
            }
        }
        let gate = self
            .ctx
            .shard_gates
            .lock()
            .expect("shard gates lock poisoned")
            .remove(&pgid);
        if let Some(gate) = gate {
            gate.close();
        }
        debug!(pg = %pgid, "placement group forgotten");
    }

    /// Stop admitting requests and unwind every pending one without a reply.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(in_flight = self.ctx.tracker.len(), "request pipeline shutting down");

        let states: Vec<Arc<ConnectionState>> = self
            .connections
            .lock()
            .expect("connections lock poisoned")
            .values()
            .cloned()
            .collect();
        for state in states {
            state.gate.close();
            for (_, sequencer) in state.drain_sequencers() {
                sequencer.abort();
            }
        }
        let gates: Vec<Arc<Gate>> = self
            .ctx
            .shard_gates
            .lock()
            .expect("shard gates lock poisoned")
            .values()
            .cloned()
            .collect();
        for gate in gates {
            gate.close();
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.ctx.is_shutting_down()
    }

    /// The in-flight request registry.
    pub fn tracker(&self) -> &Arc<OpTracker> {
        &self.ctx.tracker
    }

    /// The event bus requests publish on.
    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    /// State of connection `id`, if it has submitted anything.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Number of connections with pipeline state.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .len()
    }

    fn connection_state(&self, id: ConnectionId) -> Arc<ConnectionState> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .entry(id)
            .or_insert_with(|| Arc::new(ConnectionState::new(id)))
            .clone()
    }
}
