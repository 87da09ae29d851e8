//! Per-(connection, shard) op ordering.
//!
//! Every request reserves its slot at construction: it remembers the id of
//! the previously issued request as `prev` and becomes the last issued one.
//! [`OpSequencer::start_op`] then admits it only once `prev` has finished,
//! so replies for one connection and placement group leave in submission
//! order regardless of how the individual waits interleave.

use std::future::Future;

use tide_types::OpId;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{RequestError, SequencerError};
use crate::gate::GateHandle;

/// Observable sequencer state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencerState {
    /// Id of the most recently constructed request.
    pub last_issued: OpId,
    /// Id of the most recently finished request.
    pub last_completed: OpId,
    /// Admitted request currently running its body, if any.
    pub in_flight: Option<OpId>,
    /// Whether the sequencer has been aborted.
    pub aborted: bool,
}

/// Orders completions of the requests of one (connection, shard) pair.
pub struct OpSequencer {
    state: watch::Sender<SequencerState>,
}

impl OpSequencer {
    /// Create a sequencer with nothing issued.
    pub fn new() -> Self {
        let (state, _) = watch::channel(SequencerState::default());
        Self { state }
    }

    /// Reserve the next ordering slot for `my_id`.
    ///
    /// Returns the id the op must wait for ([`OpId::NONE`] for the first).
    pub fn reserve(&self, my_id: OpId) -> OpId {
        let mut prev = OpId::NONE;
        self.state.send_modify(|s| {
            prev = s.last_issued;
            s.last_issued = my_id;
        });
        prev
    }

    /// Wait until `prev_id` has finished, then run `body` as `my_id`.
    ///
    /// The handle must not hold a checkpoint: admission waits may be long
    /// and would otherwise stall every op queued behind it.
    pub async fn start_op<F, Fut, T>(
        &self,
        handle: GateHandle,
        prev_id: OpId,
        my_id: OpId,
        body: F,
    ) -> Result<T, RequestError>
    where
        F: FnOnce(GateHandle) -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        if let Some(checkpoint) = handle.held() {
            return Err(SequencerError::StillInGate {
                op: my_id,
                checkpoint,
            }
            .into());
        }

        let mut rx = self.state.subscribe();
        let admitted = *rx
            .wait_for(|s| s.aborted || s.last_completed == prev_id)
            .await
            .map_err(|_| SequencerError::Aborted)?;
        if admitted.aborted {
            trace!(op = %my_id, "sequencer aborted before admission");
            return Err(SequencerError::Aborted.into());
        }

        self.state.send_modify(|s| s.in_flight = Some(my_id));
        trace!(op = %my_id, prev = %prev_id, "admitted");
        body(handle).await
    }

    /// Mark `my_id` complete, admitting the op that waits on it.
    pub fn finish_op(&self, my_id: OpId) {
        self.state.send_modify(|s| {
            s.last_completed = my_id;
            if s.in_flight == Some(my_id) {
                s.in_flight = None;
            }
        });
        trace!(op = %my_id, "finished");
    }

    /// Forget the admission of a restarting op.
    ///
    /// The op keeps its slot: `last_completed` has not moved past its
    /// `prev_id`, so its retry is admitted again and every later op keeps
    /// waiting on it.
    pub fn maybe_reset(&self, my_id: OpId) {
        let reset = self.state.send_if_modified(|s| {
            if s.in_flight == Some(my_id) {
                s.in_flight = None;
                true
            } else {
                false
            }
        });
        if reset {
            debug!(op = %my_id, "admission reset for restart");
        }
    }

    /// Break the sequencer. Every current and future admission fails.
    pub fn abort(&self) {
        let aborted = self.state.send_if_modified(|s| {
            if s.aborted {
                return false;
            }
            s.aborted = true;
            s.in_flight = None;
            true
        });
        if aborted {
            debug!(last_issued = %self.state().last_issued, "sequencer aborted");
        }
    }

    /// Whether [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.state.borrow().aborted
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SequencerState {
        *self.state.borrow()
    }
}

impl Default for OpSequencer {
    fn default() -> Self {
        Self::new()
    }
}
