//! Object context locking.
//!
//! Every object has one context (its in-memory state) guarded by an async
//! mutex. A [`LockedContext`] is the exclusive right to read and mutate that
//! state; dropping it unlocks the object for the next op.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tide_types::ObjectId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// In-memory state of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectState {
    /// Whether the object exists.
    pub exists: bool,
    /// Version, bumped on every successful mutation.
    pub version: u64,
    /// Object body.
    pub data: Vec<u8>,
    /// Extended attributes.
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

struct ContextSlot {
    state: Arc<AsyncMutex<ObjectState>>,
    holders: Arc<AtomicUsize>,
}

/// Hands out exclusive object contexts and tracks how many ops hold each.
#[derive(Default)]
pub struct ObcLockManager {
    slots: Mutex<HashMap<ObjectId, ContextSlot>>,
    max_holders: Arc<AtomicUsize>,
}

impl ObcLockManager {
    /// Create an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the context of `object`, waiting behind any current holder.
    ///
    /// Waiters are admitted in FIFO order.
    pub async fn lock(&self, object: ObjectId) -> LockedContext {
        let (state, holders) = {
            let mut slots = self.slots.lock().expect("obc slots lock poisoned");
            let slot = slots.entry(object).or_insert_with(|| ContextSlot {
                state: Arc::new(AsyncMutex::new(ObjectState::default())),
                holders: Arc::new(AtomicUsize::new(0)),
            });
            (slot.state.clone(), slot.holders.clone())
        };

        let guard = state.lock_owned().await;
        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_holders.fetch_max(now, Ordering::SeqCst);
        trace!(%object, holders = now, "object context locked");

        LockedContext {
            object,
            guard,
            holders,
        }
    }

    /// Highest number of simultaneous holders ever observed for one object.
    pub fn max_concurrent_holders(&self) -> usize {
        self.max_holders.load(Ordering::SeqCst)
    }

    /// Snapshot of an object's state, waiting for its current holder.
    pub async fn snapshot(&self, object: ObjectId) -> Option<ObjectState> {
        let state = {
            let slots = self.slots.lock().expect("obc slots lock poisoned");
            slots.get(&object).map(|slot| slot.state.clone())?
        };
        let guard = state.lock().await;
        Some(guard.clone())
    }
}

/// Exclusive access to one object's context.
pub struct LockedContext {
    object: ObjectId,
    guard: OwnedMutexGuard<ObjectState>,
    holders: Arc<AtomicUsize>,
}

impl LockedContext {
    /// The locked object.
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Read the object state.
    pub fn state(&self) -> &ObjectState {
        &self.guard
    }

    /// Mutate the object state.
    pub fn state_mut(&mut self) -> &mut ObjectState {
        &mut self.guard
    }
}

impl Drop for LockedContext {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::SeqCst);
        trace!(object = %self.object, "object context unlocked");
    }
}

impl std::fmt::Debug for LockedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedContext")
            .field("object", &self.object)
            .field("version", &self.guard.version)
            .finish()
    }
}
