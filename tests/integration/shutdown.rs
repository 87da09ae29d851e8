//! Integration test: shutdown and connection teardown with requests in
//! every stage of the pipeline.

use std::time::Duration;

use tide_integration_tests::{IntegrationNode, connection, finish_all, tally};
use tide_pg::{Connection, MemoryRecovery};
use tide_types::ObjectId;
use tide_types::events::{RequestFinished, RequestOutcome};

#[tokio::test]
async fn test_shutdown_with_requests_in_flight() {
    let node = IntegrationNode::new(3, MemoryRecovery::manual());
    node.pg(0).mark_missing(ObjectId::from_name("stuck"), 2);
    node.pg(1).set_active(false);

    let mut handles = Vec::new();
    for client in 0..4u64 {
        let conn = connection(client);
        for tid in 0..10u64 {
            let pg = (tid % 3) as usize;
            let object = if pg == 0 { "stuck" } else { "free" };
            let msg = node.write(client, tid, pg, object, b"x");
            handles.push(node.service.submit(conn.clone(), msg).unwrap());
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!node.service.tracker().is_empty());

    node.service.shutdown();
    let outcomes = finish_all(handles, Duration::from_secs(5)).await;

    let counts = tally(&outcomes);
    assert_eq!(
        counts.get(&RequestOutcome::ShutDown).copied().unwrap_or(0)
            + counts.get(&RequestOutcome::Replied).copied().unwrap_or(0),
        outcomes.len()
    );
    // Nothing in the stuck or inactive groups can have completed.
    assert!(counts.get(&RequestOutcome::ShutDown).copied().unwrap_or(0) >= 27);
    assert!(node.service.tracker().is_empty());

    let refused = node
        .service
        .submit(connection(9), node.write(9, 0, 2, "late", b"x"));
    assert!(refused.is_err());
}

#[tokio::test]
async fn test_closing_connections_leaves_others_running() {
    let node = IntegrationNode::new(1, MemoryRecovery::manual());
    let mut finished = node.events.subscribe::<RequestFinished>();
    node.pg(0).set_active(false);

    let closing = connection(1);
    let staying = connection(2);
    let mut closing_handles = Vec::new();
    let mut staying_handles = Vec::new();
    for tid in 0..5u64 {
        let msg = node.write(1, tid, 0, "a", b"x");
        closing_handles.push(node.service.submit(closing.clone(), msg).unwrap());
        let msg = node.write(2, tid, 0, "b", b"y");
        staying_handles.push(node.service.submit(staying.clone(), msg).unwrap());
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    closing.close();
    node.service.connection_closed(closing.id());
    node.pg(0).set_active(true);

    let closed = finish_all(closing_handles, Duration::from_secs(5)).await;
    let kept = finish_all(staying_handles, Duration::from_secs(5)).await;

    assert!(kept.iter().all(|o| *o == RequestOutcome::Replied));
    assert!(closed.iter().filter(|o| **o == RequestOutcome::Aborted).count() >= 4);
    assert_eq!(closing.reply_count(), 0);
    assert_eq!(staying.reply_count(), 5);

    let mut seen = 0;
    while finished.try_recv().is_some() {
        seen += 1;
    }
    assert_eq!(seen, 10);
}
