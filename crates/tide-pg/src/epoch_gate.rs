//! Watch-based cluster map epoch gate.

use tide_types::Epoch;
use tokio::sync::watch;
use tracing::debug;

use crate::error::PgError;
use crate::traits::MapGate;

/// Tracks the newest cluster map epoch the node has consumed.
pub struct EpochGate {
    tx: watch::Sender<Epoch>,
}

impl EpochGate {
    /// Create a gate starting at `epoch`.
    pub fn new(epoch: Epoch) -> Self {
        let (tx, _) = watch::channel(epoch);
        Self { tx }
    }

    /// Publish a new map epoch. Older epochs are ignored.
    pub fn advance_to(&self, epoch: Epoch) {
        let advanced = self.tx.send_if_modified(|current| {
            if epoch > *current {
                *current = epoch;
                true
            } else {
                false
            }
        });
        if advanced {
            debug!(%epoch, "map epoch advanced");
        }
    }
}

#[async_trait::async_trait]
impl MapGate for EpochGate {
    async fn wait_for_epoch(&self, min: Epoch) -> Result<Epoch, PgError> {
        let mut rx = self.tx.subscribe();
        let epoch = *rx
            .wait_for(|epoch| *epoch >= min)
            .await
            .map_err(|_| PgError::ShuttingDown)?;
        Ok(epoch)
    }

    fn current_epoch(&self) -> Epoch {
        *self.tx.borrow()
    }
}
