//! Recovery of missing or degraded objects before they are served.

use std::sync::Arc;

use tide_pg::{PgError, PlacementGroup, RecoveryBackend};
use tide_types::ObjectId;
use tide_types::events::{EventBus, RecoveryRequested, RecoveryResolved};
use tracing::{debug, warn};

/// Bridges the request pipeline to the recovery backend.
///
/// Requests for the same object share one recovery: the first one starts
/// it, later ones join its completion handle.
#[derive(Clone)]
pub struct RecoveryTrigger {
    backend: Arc<dyn RecoveryBackend>,
    events: EventBus,
}

impl RecoveryTrigger {
    /// Create a trigger over `backend`, publishing on `events`.
    pub fn new(backend: Arc<dyn RecoveryBackend>, events: EventBus) -> Self {
        Self { backend, events }
    }

    /// Resolve once `object` is readable on `pg`.
    ///
    /// Returns immediately if the object is neither unreadable nor degraded.
    /// Fails with [`PgError::RecoveryFailed`] if recovery gives up.
    pub async fn ensure_readable(
        &self,
        pg: &Arc<dyn PlacementGroup>,
        object: ObjectId,
    ) -> Result<(), PgError> {
        if !pg.is_unreadable_or_degraded(object) {
            return Ok(());
        }

        let existing = if self.backend.is_recovering(object) {
            self.backend.get_recovery_wait(object)
        } else {
            None
        };
        let joined_existing = existing.is_some();
        let wait = match existing {
            Some(wait) => wait,
            None => {
                // Degraded-only objects are readable locally; recover them at
                // whatever version the replicas are missing.
                let version = pg.missing_version(object).unwrap_or(0);
                self.backend
                    .start_recovery(object, version, pg.clone(), pg.map_epoch())
            }
        };

        debug!(pg = %pg.id(), %object, joined_existing, "waiting for recovery");
        self.events.emit(RecoveryRequested {
            pgid: pg.id(),
            object,
            joined_existing,
        });

        let result = wait.wait().await;
        if let Err(e) = &result {
            warn!(pg = %pg.id(), %object, error = %e, "recovery failed");
        }
        self.events.emit(RecoveryResolved {
            pgid: pg.id(),
            object,
            recovered: result.is_ok(),
        });
        result
    }
}
