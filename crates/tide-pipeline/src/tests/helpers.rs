//! Shared test utilities for tide-pipeline tests.

use std::sync::Arc;
use std::time::Duration;

use tide_pg::{EpochGate, MemoryConnection, MemoryPg, MemoryPgRegistry, MemoryRecovery, PgRole};
use tide_types::events::{EventBus, RequestOutcome};
use tide_types::{
    ClientMessage, ConnectionId, Epoch, OpFlags, OpReply, PgId, Reply, RequestId, SubOp,
};
use tokio::task::JoinHandle;

use crate::request::RequestState;
use crate::service::OpService;

pub const PG: PgId = PgId {
    pool: 1,
    seed: 0,
    shard: PgId::NO_SHARD,
};

pub const START_EPOCH: Epoch = Epoch(10);

/// One node: map gate, registry, recovery backend and the op service.
pub struct TestNode {
    pub map: Arc<EpochGate>,
    pub registry: Arc<MemoryPgRegistry>,
    pub recovery: Arc<MemoryRecovery>,
    pub events: EventBus,
    pub service: OpService,
}

impl TestNode {
    /// A node at [`START_EPOCH`] hosting [`PG`] as primary.
    pub fn new() -> (Self, Arc<MemoryPg>) {
        let node = Self::empty();
        let pg = Arc::new(MemoryPg::new(PG, START_EPOCH));
        node.registry.insert(pg.clone());
        (node, pg)
    }

    /// Like [`new`](Self::new) but the placement group holds `role`.
    pub fn with_role(role: PgRole) -> (Self, Arc<MemoryPg>) {
        let node = Self::empty();
        let pg = Arc::new(MemoryPg::new(PG, START_EPOCH).with_role(role));
        node.registry.insert(pg.clone());
        (node, pg)
    }

    /// A node hosting no placement group.
    pub fn empty() -> Self {
        let map = Arc::new(EpochGate::new(START_EPOCH));
        let registry = Arc::new(MemoryPgRegistry::new());
        let recovery = Arc::new(MemoryRecovery::manual());
        let events = EventBus::new();
        let service = OpService::new(
            map.clone(),
            registry.clone(),
            recovery.clone(),
            events.clone(),
        );
        Self {
            map,
            registry,
            recovery,
            events,
            service,
        }
    }

    /// Submit `msg` on `conn`, panicking if it is refused.
    pub fn submit(
        &self,
        conn: &Arc<MemoryConnection>,
        msg: ClientMessage,
    ) -> JoinHandle<RequestOutcome> {
        self.service.submit(conn.clone(), msg).unwrap()
    }
}

pub fn connection(id: u64) -> Arc<MemoryConnection> {
    Arc::new(MemoryConnection::new(ConnectionId(id)))
}

pub fn reqid(client: u64, tid: u64) -> RequestId {
    RequestId {
        client,
        incarnation: 0,
        tid,
    }
}

/// A message targeting [`PG`] sent with the start epoch.
pub fn message(client: u64, tid: u64, object: &str, ops: Vec<SubOp>) -> ClientMessage {
    ClientMessage::new(reqid(client, tid), PG, object, ops)
        .with_epochs(START_EPOCH, START_EPOCH)
}

pub fn write(client: u64, tid: u64, object: &str, data: &[u8]) -> ClientMessage {
    message(
        client,
        tid,
        object,
        vec![SubOp::WriteFull {
            data: data.to_vec(),
        }],
    )
}

pub fn read(client: u64, tid: u64, object: &str) -> ClientMessage {
    message(
        client,
        tid,
        object,
        vec![SubOp::Read {
            offset: 0,
            length: 0,
        }],
    )
}

pub fn balanced_read(client: u64, tid: u64, object: &str) -> ClientMessage {
    let msg = read(client, tid, object);
    let flags = msg.flags | OpFlags::BALANCE_READS;
    msg.with_flags(flags)
}

/// Every op reply sent on `conn`, in send order.
pub fn op_replies(conn: &MemoryConnection) -> Vec<OpReply> {
    conn.replies()
        .into_iter()
        .filter_map(|reply| match reply {
            Reply::Op(reply) => Some(reply),
            Reply::MapAdvisory { .. } => None,
        })
        .collect()
}

/// Await a request's outcome, failing the test if it takes too long.
pub async fn outcome(handle: JoinHandle<RequestOutcome>) -> RequestOutcome {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("request did not finish")
        .expect("request task panicked")
}

/// Give spawned requests a chance to reach their next wait.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Wait until some tracked request reaches `state`.
pub async fn reached(node: &TestNode, state: RequestState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !node
            .service
            .tracker()
            .dump()
            .iter()
            .any(|op| op.state == state)
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no request reached {state:?}"));
}
