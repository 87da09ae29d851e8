//! Type-safe event bus for intra-node pub/sub.
//!
//! The [`EventBus`] allows any component to emit typed events and any other
//! component to subscribe to specific event types without direct coupling.
//! The request pipeline publishes request outcomes, restarts and recovery
//! activity here; the simulator and the tests subscribe to them.
//!
//! # Design
//!
//! Each event type is a distinct struct implementing the [`Event`] marker trait.
//! Internally, the bus maintains a `HashMap<TypeId, Box<dyn Any>>` where each
//! value is a `tokio::sync::broadcast::Sender<E>`. Channels are created lazily
//! on the first `subscribe()` for a given type.
//!
//! # Example
//!
//! ```rust
//! use tide_types::events::{EventBus, RequestFinished, RequestOutcome};
//! use tide_types::{OpId, PgId, RequestId};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<RequestFinished>();
//!
//! bus.emit(RequestFinished {
//!     op_id: OpId(7),
//!     reqid: RequestId { client: 1, incarnation: 0, tid: 1 },
//!     pgid: PgId::new(1, 0),
//!     outcome: RequestOutcome::Replied,
//! });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.op_id, OpId(7));
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::{ConnectionId, ObjectId, OpId, PgId, RequestId};

// ---------------------------------------------------------------------------
// Event trait
// ---------------------------------------------------------------------------

/// Marker trait for all events that can travel through the [`EventBus`].
///
/// Every event is a distinct struct with its own fields. Subscribers receive
/// only events of the type they subscribed to.
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// How a client request left the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RequestOutcome {
    /// Answered after execution, including with a client-visible error code.
    Replied,
    /// Stale map; only a map advisory was sent.
    Discarded,
    /// Already completed earlier; the recorded result was replayed.
    Deduplicated,
    /// Misdirected to a non-primary; dropped without a reply.
    Dropped,
    /// Non-primary could not serve the read; told to try again.
    Rejected,
    /// Terminated by an error without a reply.
    Failed,
    /// Abandoned because this node lost authority over the placement group.
    Aborted,
    /// Abandoned because the node is shutting down.
    ShutDown,
}

/// A client request has left the pipeline.
#[derive(Clone, Debug)]
pub struct RequestFinished {
    /// Node-local op id.
    pub op_id: OpId,
    /// Client request id.
    pub reqid: RequestId,
    /// Target placement group.
    pub pgid: PgId,
    /// How the request ended.
    pub outcome: RequestOutcome,
}
impl Event for RequestFinished {}

/// A client request is restarting after an acting set change.
#[derive(Clone, Debug)]
pub struct RequestRestarted {
    /// Node-local op id (unchanged across restarts).
    pub op_id: OpId,
    /// Target placement group.
    pub pgid: PgId,
    /// Number of restarts so far, including this one.
    pub restarts: u32,
}
impl Event for RequestRestarted {}

/// The op sequencer for a (connection, placement group) pair was aborted.
#[derive(Clone, Debug)]
pub struct SequencerAborted {
    /// Owning connection.
    pub connection: ConnectionId,
    /// Placement group.
    pub pgid: PgId,
}
impl Event for SequencerAborted {}

/// A request found its object missing or degraded and is waiting for recovery.
#[derive(Clone, Debug)]
pub struct RecoveryRequested {
    /// Placement group holding the object.
    pub pgid: PgId,
    /// Object being recovered.
    pub object: ObjectId,
    /// `true` if the request joined a recovery that was already running.
    pub joined_existing: bool,
}
impl Event for RecoveryRequested {}

/// A recovery wait has resolved.
#[derive(Clone, Debug)]
pub struct RecoveryResolved {
    /// Placement group holding the object.
    pub pgid: PgId,
    /// Object that was being recovered.
    pub object: ObjectId,
    /// Whether the object is readable again.
    pub recovered: bool,
}
impl Event for RecoveryResolved {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Inner state of the event bus, protected by a mutex.
///
/// Each entry maps a `TypeId` to a type-erased `broadcast::Sender<E>`.
struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// A type-safe event bus for intra-node communication.
///
/// Clonable (`Arc` inside). Thread-safe. Non-blocking emits.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// Non-blocking: if no subscribers exist the event is dropped.
    pub fn emit<E: Event>(&self, event: E) {
        let type_id = TypeId::of::<E>();
        let inner = self.inner.lock().expect("event bus lock poisoned");

        if let Some(sender) = inner
            .channels
            .get(&type_id)
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            // No active receivers is fine: nobody is listening.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    ///
    /// The channel is created lazily if it doesn't exist yet.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let type_id = TypeId::of::<E>();
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let sender = inner
            .channels
            .entry(type_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventReceiver
// ---------------------------------------------------------------------------

/// Typed receiver for a specific event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` if the bus has been dropped. Skips over lagged events
    /// with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
