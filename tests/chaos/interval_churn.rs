//! Chaos test: acting set changes while clients keep sending.
//!
//! Placement groups start new intervals at random while requests are queued
//! and executing. Every request must terminate, replies must stay in order,
//! and restarted writes must not be applied twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tide_integration_tests::{
    IntegrationNode, assert_replies_in_order, connection, finish_all, tally,
};
use tide_pg::{MapGate, MemoryRecovery, PgRole};
use tide_types::events::{RequestOutcome, RequestRestarted};

const CONNECTIONS: u64 = 8;
const OPS: u64 = 100;

/// Start a new interval every few milliseconds until `stop` is set. Every
/// other interval is left inactive until the next change so waiting ops see
/// the change.
fn spawn_churn(
    node: Arc<IntegrationNode>,
    stop: Arc<AtomicBool>,
    seed: u64,
    demote: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut step = 0u64;
        while !stop.load(Ordering::Relaxed) {
            step += 1;
            let epoch = node.map.current_epoch().next();
            let index = rng.random_range(0..node.pgs().len());
            let pg = node.pg(index);
            node.advance_all(epoch);

            let role = if demote && rng.random_bool(0.3) {
                PgRole::Replica
            } else {
                PgRole::Primary
            };
            pg.start_interval(epoch, role, role != PgRole::Primary);

            tokio::time::sleep(Duration::from_millis(3)).await;
            if step % 2 == 0 {
                pg.set_active(true);
            }
        }
        for pg in node.pgs() {
            let epoch = node.map.current_epoch().next();
            node.advance_all(epoch);
            pg.start_interval(epoch, PgRole::Primary, false);
            pg.set_active(true);
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_primary_keeps_order_through_interval_changes() {
    let node = Arc::new(IntegrationNode::new(2, MemoryRecovery::manual()));
    for pg in node.pgs() {
        pg.set_exec_delay(Some(Duration::from_millis(1)));
    }
    let mut restarted = node.events.subscribe::<RequestRestarted>();
    let stop = Arc::new(AtomicBool::new(false));
    let churn = spawn_churn(node.clone(), stop.clone(), 5, false);

    let mut clients = Vec::new();
    for client in 0..CONNECTIONS {
        let node = node.clone();
        clients.push(tokio::spawn(async move {
            let conn = connection(client);
            let mut rng = StdRng::seed_from_u64(100 + client);
            let mut writes: HashMap<(usize, String), u64> = HashMap::new();
            let mut handles = Vec::new();
            for tid in 0..OPS {
                let pg = rng.random_range(0..2usize);
                let object = format!("obj-{}", rng.random_range(0..4u32));
                *writes.entry((pg, object.clone())).or_default() += 1;
                let msg = node.write(client, tid, pg, &object, b"v");
                handles.push(node.service.submit(conn.clone(), msg).unwrap());
                if tid % 10 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            let outcomes = finish_all(handles, Duration::from_secs(30)).await;
            assert_replies_in_order(&conn);
            (outcomes, writes)
        }));
    }

    // Keep churning until every client has submitted, then let the groups
    // settle so queued requests can drain.
    tokio::time::sleep(Duration::from_millis(150)).await;
    stop.store(true, Ordering::Relaxed);
    churn.await.unwrap();

    let mut all = Vec::new();
    let mut expected: HashMap<(usize, String), u64> = HashMap::new();
    for client in clients {
        let (outcomes, writes) = client.await.unwrap();
        all.extend(outcomes);
        for (key, count) in writes {
            *expected.entry(key).or_default() += count;
        }
    }

    let counts = tally(&all);
    assert_eq!(counts.get(&RequestOutcome::Replied), Some(&all.len()));
    for ((pg, object), writes) in expected {
        let state = node.pg(pg).object(&object).await.unwrap();
        assert_eq!(state.version, writes, "write to {object} applied twice or lost");
    }
    assert!(restarted.try_recv().is_some(), "churn never restarted a request");
    assert!(node.service.tracker().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_demotions_never_hang_requests() {
    let node = Arc::new(IntegrationNode::new(3, MemoryRecovery::manual()));
    let stop = Arc::new(AtomicBool::new(false));
    let churn = spawn_churn(node.clone(), stop.clone(), 9, true);

    let mut handles = Vec::new();
    for client in 0..CONNECTIONS {
        let conn = connection(client);
        for tid in 0..OPS {
            let pg = (tid % 3) as usize;
            let msg = if tid % 2 == 0 {
                node.write(client, tid, pg, "x", b"v")
            } else {
                node.read(client, tid, pg, "x")
            };
            handles.push(node.service.submit(conn.clone(), msg).unwrap());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.store(true, Ordering::Relaxed);
    churn.await.unwrap();

    let outcomes = finish_all(handles, Duration::from_secs(30)).await;
    assert!(outcomes.iter().all(|o| matches!(
        o,
        RequestOutcome::Replied
            | RequestOutcome::Aborted
            | RequestOutcome::Discarded
            | RequestOutcome::Dropped
            | RequestOutcome::Deduplicated
    )));
    assert!(node.service.tracker().is_empty());
}
