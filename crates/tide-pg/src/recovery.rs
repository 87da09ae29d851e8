//! In-memory recovery backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tide_types::{Epoch, ObjectId};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::traits::{PlacementGroup, RecoveryBackend, RecoveryState, RecoveryWait};

struct InFlight {
    tx: watch::Sender<RecoveryState>,
    pg: Arc<dyn PlacementGroup>,
}

type Registry = Arc<Mutex<HashMap<ObjectId, InFlight>>>;

/// How recoveries are driven to completion.
enum Driver {
    /// Tests resolve each recovery with [`MemoryRecovery::complete`] or
    /// [`MemoryRecovery::fail`].
    Manual,
    /// A spawned task resolves each recovery after `delay`, failing a
    /// `fail_ratio` fraction of them.
    Simulated {
        delay: Duration,
        fail_ratio: f64,
        rng: Mutex<StdRng>,
    },
}

/// Registry of in-flight object recoveries.
///
/// At most one recovery per object is registered at a time; every request
/// that needs the object shares its completion handle.
pub struct MemoryRecovery {
    inflight: Registry,
    driver: Driver,
    started: AtomicU64,
}

impl MemoryRecovery {
    /// Recoveries stay pending until resolved explicitly.
    pub fn manual() -> Self {
        Self {
            inflight: Arc::default(),
            driver: Driver::Manual,
            started: AtomicU64::new(0),
        }
    }

    /// Recoveries resolve on their own after `delay`.
    ///
    /// Must be used from within a tokio runtime.
    pub fn simulated(delay: Duration, fail_ratio: f64, seed: u64) -> Self {
        Self {
            inflight: Arc::default(),
            driver: Driver::Simulated {
                delay,
                fail_ratio: fail_ratio.clamp(0.0, 1.0),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            },
            started: AtomicU64::new(0),
        }
    }

    /// Number of recoveries started so far.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Mark the recovery of `object` successful. Returns `false` if none is
    /// registered.
    pub fn complete(&self, object: ObjectId) -> bool {
        resolve(&self.inflight, object, RecoveryState::Recovered)
    }

    /// Mark the recovery of `object` failed. Returns `false` if none is
    /// registered.
    pub fn fail(&self, object: ObjectId, reason: impl Into<String>) -> bool {
        resolve(&self.inflight, object, RecoveryState::Failed(reason.into()))
    }
}

fn resolve(inflight: &Registry, object: ObjectId, state: RecoveryState) -> bool {
    let Some(entry) = inflight
        .lock()
        .expect("recovery registry lock poisoned")
        .remove(&object)
    else {
        return false;
    };

    if state == RecoveryState::Recovered {
        entry.pg.on_local_recover(object);
        info!(pg = %entry.pg.id(), %object, "object recovered");
    } else {
        warn!(pg = %entry.pg.id(), %object, ?state, "object recovery failed");
    }
    entry.tx.send_replace(state);
    true
}

impl RecoveryBackend for MemoryRecovery {
    fn is_recovering(&self, object: ObjectId) -> bool {
        self.inflight
            .lock()
            .expect("recovery registry lock poisoned")
            .contains_key(&object)
    }

    fn get_recovery_wait(&self, object: ObjectId) -> Option<RecoveryWait> {
        self.inflight
            .lock()
            .expect("recovery registry lock poisoned")
            .get(&object)
            .map(|entry| RecoveryWait::new(object, entry.tx.subscribe()))
    }

    fn start_recovery(
        &self,
        object: ObjectId,
        version: u64,
        pg: Arc<dyn PlacementGroup>,
        epoch: Epoch,
    ) -> RecoveryWait {
        let pgid = pg.id();
        let rx = {
            let mut inflight = self.inflight.lock().expect("recovery registry lock poisoned");
            if let Some(entry) = inflight.get(&object) {
                return RecoveryWait::new(object, entry.tx.subscribe());
            }
            let (tx, rx) = watch::channel(RecoveryState::Pending);
            inflight.insert(object, InFlight { tx, pg });
            rx
        };
        self.started.fetch_add(1, Ordering::SeqCst);
        debug!(pg = %pgid, %object, version, %epoch, "recovery started");

        if let Driver::Simulated {
            delay,
            fail_ratio,
            rng,
        } = &self.driver
        {
            let fails = rng
                .lock()
                .expect("recovery rng lock poisoned")
                .random_bool(*fail_ratio);
            let delay = *delay;
            let inflight = self.inflight.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let state = if fails {
                    RecoveryState::Failed("simulated recovery failure".to_string())
                } else {
                    RecoveryState::Recovered
                };
                resolve(&inflight, object, state);
            });
        }

        RecoveryWait::new(object, rx)
    }
}

#[cfg(test)]
mod tests {
    use tide_types::PgId;

    use super::*;
    use crate::error::PgError;
    use crate::memory_pg::MemoryPg;

    fn degraded_pg(object: ObjectId) -> Arc<MemoryPg> {
        let pg = Arc::new(MemoryPg::new(PgId::new(1, 0), Epoch(3)));
        pg.mark_missing(object, 4);
        pg
    }

    #[tokio::test]
    async fn test_second_start_joins_existing_recovery() {
        let recovery = MemoryRecovery::manual();
        let object = ObjectId::from_name("obj");
        let pg = degraded_pg(object);

        let first = recovery.start_recovery(object, 4, pg.clone(), Epoch(3));
        let second = recovery.start_recovery(object, 4, pg.clone(), Epoch(3));
        assert_eq!(recovery.started(), 1);
        assert!(recovery.is_recovering(object));
        assert!(recovery.get_recovery_wait(object).is_some());

        assert!(recovery.complete(object));
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert!(!recovery.is_recovering(object));
        assert!(!pg.is_unreadable_or_degraded(object));
    }

    #[tokio::test]
    async fn test_failed_recovery_keeps_object_unreadable() {
        let recovery = MemoryRecovery::manual();
        let object = ObjectId::from_name("obj");
        let pg = degraded_pg(object);

        let wait = recovery.start_recovery(object, 4, pg.clone(), Epoch(3));
        assert!(recovery.fail(object, "all replicas down"));
        assert!(matches!(wait.wait().await, Err(PgError::RecoveryFailed { .. })));
        assert!(pg.is_unreadable_or_degraded(object));
    }

    #[tokio::test]
    async fn test_simulated_recovery_completes_on_its_own() {
        let recovery = MemoryRecovery::simulated(Duration::from_millis(5), 0.0, 7);
        let object = ObjectId::from_name("obj");
        let pg = degraded_pg(object);

        recovery
            .start_recovery(object, 4, pg.clone(), Epoch(3))
            .wait()
            .await
            .unwrap();
        assert!(!pg.is_unreadable_or_degraded(object));
    }

    #[test]
    fn test_resolve_unknown_recovery_is_noop() {
        let recovery = MemoryRecovery::manual();
        assert!(!recovery.complete(ObjectId::from_name("nothing")));
        assert!(!recovery.fail(ObjectId::from_name("nothing"), "x"));
    }
}
