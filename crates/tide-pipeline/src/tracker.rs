//! Registry of in-flight client requests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tide_types::{ConnectionId, OpId, PgId};

use crate::request::RequestState;

/// Snapshot of one in-flight request.
#[derive(Debug, Clone, Serialize)]
pub struct OpSummary {
    /// Node-local op id.
    pub id: OpId,
    /// The request's message, as printed in logs.
    pub description: String,
    /// Current pipeline state.
    pub state: RequestState,
    /// Originating connection.
    pub connection: ConnectionId,
    /// Target placement group.
    pub pg: PgId,
    /// Number of restarts after acting set changes.
    pub restarts: u32,
    /// Milliseconds since the request was submitted.
    pub age_ms: u64,
}

struct Entry {
    description: String,
    state: RequestState,
    connection: ConnectionId,
    pg: PgId,
    restarts: u32,
    started_at: Instant,
}

/// Tracks every request between submission and destruction.
#[derive(Default)]
pub struct OpTracker {
    ops: Mutex<BTreeMap<OpId, Entry>>,
}

impl OpTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        id: OpId,
        description: String,
        connection: ConnectionId,
        pg: PgId,
    ) {
        self.ops.lock().expect("tracker lock poisoned").insert(
            id,
            Entry {
                description,
                state: RequestState::Init,
                connection,
                pg,
                restarts: 0,
                started_at: Instant::now(),
            },
        );
    }

    pub(crate) fn set_state(&self, id: OpId, state: RequestState) {
        if let Some(entry) = self.ops.lock().expect("tracker lock poisoned").get_mut(&id) {
            entry.state = state;
        }
    }

    pub(crate) fn note_restart(&self, id: OpId) {
        if let Some(entry) = self.ops.lock().expect("tracker lock poisoned").get_mut(&id) {
            entry.restarts += 1;
        }
    }

    pub(crate) fn remove(&self, id: OpId) {
        self.ops.lock().expect("tracker lock poisoned").remove(&id);
    }

    /// Number of tracked requests.
    pub fn len(&self) -> usize {
        self.ops.lock().expect("tracker lock poisoned").len()
    }

    /// Whether no request is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current state of request `id`, if still tracked.
    pub fn state_of(&self, id: OpId) -> Option<RequestState> {
        self.ops
            .lock()
            .expect("tracker lock poisoned")
            .get(&id)
            .map(|entry| entry.state)
    }

    /// Snapshot of every tracked request, ordered by id.
    pub fn dump(&self) -> Vec<OpSummary> {
        let ops = self.ops.lock().expect("tracker lock poisoned");
        ops.iter()
            .map(|(id, entry)| OpSummary {
                id: *id,
                description: entry.description.clone(),
                state: entry.state,
                connection: entry.connection,
                pg: entry.pg,
                restarts: entry.restarts,
                age_ms: entry.started_at.elapsed().as_millis() as u64,
            })
            .collect()
    }
}
