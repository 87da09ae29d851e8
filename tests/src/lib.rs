//! Shared test harness for Tidepool integration tests.
//!
//! Provides [`IntegrationNode`]: one node hosting several in-memory
//! placement groups behind a full [`OpService`], plus helpers to build
//! client messages and check reply ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tide_pg::{
    EpochGate, MapGate, MemoryConnection, MemoryPg, MemoryPgRegistry, MemoryRecovery,
    PlacementGroup,
};
use tide_pipeline::OpService;
use tide_types::events::{EventBus, RequestOutcome};
use tide_types::{ClientMessage, ConnectionId, Epoch, OpFlags, PgId, Reply, RequestId, SubOp};
use tokio::task::JoinHandle;

/// Epoch every node starts at.
pub const START_EPOCH: Epoch = Epoch(1);

/// One node with `N` primary placement groups in pool 1.
pub struct IntegrationNode {
    pub map: Arc<EpochGate>,
    pub registry: Arc<MemoryPgRegistry>,
    pub recovery: Arc<MemoryRecovery>,
    pub events: EventBus,
    pub service: Arc<OpService>,
    pgs: Vec<Arc<MemoryPg>>,
}

impl IntegrationNode {
    /// Create a node hosting `pg_count` placement groups.
    pub fn new(pg_count: u32, recovery: MemoryRecovery) -> Self {
        let map = Arc::new(EpochGate::new(START_EPOCH));
        let registry = Arc::new(MemoryPgRegistry::new());
        let recovery = Arc::new(recovery);
        let events = EventBus::new();

        let pgs: Vec<Arc<MemoryPg>> = (0..pg_count)
            .map(|seed| Arc::new(MemoryPg::new(PgId::new(1, seed), START_EPOCH)))
            .collect();
        for pg in &pgs {
            registry.insert(pg.clone());
        }

        let service = Arc::new(OpService::new(
            map.clone(),
            registry.clone(),
            recovery.clone(),
            events.clone(),
        ));
        Self {
            map,
            registry,
            recovery,
            events,
            service,
            pgs,
        }
    }

    /// Every hosted placement group.
    pub fn pgs(&self) -> &[Arc<MemoryPg>] {
        &self.pgs
    }

    /// Placement group number `i`.
    pub fn pg(&self, i: usize) -> &Arc<MemoryPg> {
        &self.pgs[i]
    }

    /// Build a write of `data` to `object` in placement group `pg`, stamped
    /// with the node's current epoch.
    pub fn write(
        &self,
        client: u64,
        tid: u64,
        pg: usize,
        object: &str,
        data: &[u8],
    ) -> ClientMessage {
        self.message(
            client,
            tid,
            pg,
            object,
            vec![SubOp::WriteFull {
                data: data.to_vec(),
            }],
        )
    }

    /// Build a full read of `object` in placement group `pg`.
    pub fn read(&self, client: u64, tid: u64, pg: usize, object: &str) -> ClientMessage {
        self.message(
            client,
            tid,
            pg,
            object,
            vec![SubOp::Read {
                offset: 0,
                length: 0,
            }],
        )
    }

    fn message(
        &self,
        client: u64,
        tid: u64,
        pg: usize,
        object: &str,
        ops: Vec<SubOp>,
    ) -> ClientMessage {
        let epoch = self.map.current_epoch();
        ClientMessage::new(
            RequestId {
                client,
                incarnation: 0,
                tid,
            },
            self.pgs[pg].id(),
            object,
            ops,
        )
        .with_flags(OpFlags::ACK | OpFlags::ONDISK)
        .with_epochs(epoch, epoch)
    }

    /// Move the node map and every placement group to `epoch`.
    pub fn advance_all(&self, epoch: Epoch) {
        for pg in &self.pgs {
            pg.advance_map(epoch);
        }
        self.map.advance_to(epoch);
    }
}

/// Open client connection number `id`.
pub fn connection(id: u64) -> Arc<MemoryConnection> {
    Arc::new(MemoryConnection::new(ConnectionId(id)))
}

/// Await every request, failing if any takes longer than `limit`.
pub async fn finish_all(
    handles: Vec<JoinHandle<RequestOutcome>>,
    limit: Duration,
) -> Vec<RequestOutcome> {
    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        let outcome = tokio::time::timeout(limit, handle)
            .await
            .expect("request hung")
            .expect("request task panicked");
        outcomes.push(outcome);
    }
    outcomes
}

/// Assert that the op replies on `conn` are in increasing tid order within
/// each placement group.
pub fn assert_replies_in_order(conn: &MemoryConnection) {
    let mut last: HashMap<PgId, u64> = HashMap::new();
    for reply in conn.replies() {
        let Reply::Op(reply) = reply else {
            continue;
        };
        if let Some(prev) = last.insert(reply.pgid, reply.reqid.tid) {
            assert!(
                prev < reply.reqid.tid,
                "reply for tid {} on {} after tid {prev}",
                reply.reqid.tid,
                reply.pgid
            );
        }
    }
}

/// Count outcomes by kind.
pub fn tally(outcomes: &[RequestOutcome]) -> HashMap<RequestOutcome, usize> {
    let mut counts = HashMap::new();
    for outcome in outcomes {
        *counts.entry(*outcome).or_default() += 1;
    }
    counts
}
