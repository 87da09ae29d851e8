//! In-memory placement group registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tide_types::PgId;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::PgError;
use crate::traits::{PgRegistry, PlacementGroup};

#[derive(Default)]
struct RegistryState {
    pgs: HashMap<PgId, Arc<dyn PlacementGroup>>,
    removed: HashSet<PgId>,
}

/// Registry of locally hosted placement groups.
///
/// Resolution of a placement group that has not been registered yet waits
/// until it is. Resolution of one that was removed fails.
pub struct MemoryPgRegistry {
    state: watch::Sender<RegistryState>,
}

impl MemoryPgRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (state, _) = watch::channel(RegistryState::default());
        Self { state }
    }

    /// Register (or replace) a placement group.
    pub fn insert(&self, pg: Arc<dyn PlacementGroup>) {
        let pgid = pg.id();
        self.state.send_modify(|state| {
            state.removed.remove(&pgid);
            state.pgs.insert(pgid, pg);
        });
        debug!(pg = %pgid, "placement group registered");
    }

    /// Remove a placement group. Later resolutions fail with
    /// [`PgError::PgNotFound`] until it is registered again.
    pub fn remove(&self, pgid: PgId) -> Option<Arc<dyn PlacementGroup>> {
        let mut removed = None;
        self.state.send_modify(|state| {
            removed = state.pgs.remove(&pgid);
            state.removed.insert(pgid);
        });
        info!(pg = %pgid, "placement group removed");
        removed
    }

    /// Look up a registered placement group without waiting.
    pub fn get(&self, pgid: PgId) -> Option<Arc<dyn PlacementGroup>> {
        self.state.borrow().pgs.get(&pgid).cloned()
    }

    /// Ids of every registered placement group.
    pub fn pg_ids(&self) -> Vec<PgId> {
        let mut ids: Vec<PgId> = self.state.borrow().pgs.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Default for MemoryPgRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PgRegistry for MemoryPgRegistry {
    async fn resolve_shard(&self, pgid: PgId) -> Result<Arc<dyn PlacementGroup>, PgError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| state.pgs.contains_key(&pgid) || state.removed.contains(&pgid))
            .await
            .map_err(|_| PgError::ShuttingDown)?;
        state.pgs.get(&pgid).cloned().ok_or(PgError::PgNotFound(pgid))
    }
}
