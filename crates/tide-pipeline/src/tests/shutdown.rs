//! Shutdown, connection teardown and placement group removal.

use std::time::Duration;

use tide_pg::{Connection, PgError};
use tide_types::ObjectId;
use tide_types::events::{RequestFinished, RequestOutcome, SequencerAborted};

use super::helpers::{PG, START_EPOCH, TestNode, connection, outcome, reached, settle, write};
use crate::error::RequestError;
use crate::request::RequestState;

#[tokio::test]
async fn test_shutdown_unwinds_pending_requests_without_reply() {
    let (node, pg) = TestNode::new();
    let conn = connection(1);
    pg.mark_missing(ObjectId::from_name("obj"), 1);

    let recovering = node.submit(&conn, write(1, 1, "obj", b"x"));
    let queued = node.submit(&conn, write(1, 2, "other", b"y"));
    settle().await;

    node.service.shutdown();
    assert_eq!(outcome(recovering).await, RequestOutcome::ShutDown);
    assert_eq!(outcome(queued).await, RequestOutcome::ShutDown);
    assert_eq!(conn.reply_count(), 0);
    assert!(node.service.tracker().is_empty());
}

#[tokio::test]
async fn test_submit_after_shutdown_is_refused() {
    let (node, _pg) = TestNode::new();
    node.service.shutdown();
    node.service.shutdown();
    assert!(node.service.is_shutting_down());

    let result = node.service.submit(connection(1), write(1, 1, "obj", b"x"));
    assert!(matches!(
        result,
        Err(RequestError::Pg(PgError::ShuttingDown))
    ));
}

#[tokio::test]
async fn test_connection_close_aborts_queued_requests() {
    let (node, pg) = TestNode::new();
    let conn = connection(4);
    let mut aborted = node.events.subscribe::<SequencerAborted>();
    let mut finished = node.events.subscribe::<RequestFinished>();
    pg.set_active(false);

    let first = node.submit(&conn, write(4, 1, "a", b"1"));
    let second = node.submit(&conn, write(4, 2, "b", b"2"));
    settle().await;

    conn.close();
    node.service.connection_closed(conn.id());
    assert_eq!(aborted.recv().await.unwrap().pgid, PG);
    assert_eq!(outcome(second).await, RequestOutcome::Aborted);
    assert_eq!(node.service.connection_count(), 0);

    // The first op is past its sequencer and finishes; its reply is lost.
    pg.set_active(true);
    assert_eq!(outcome(first).await, RequestOutcome::Replied);
    assert_eq!(conn.reply_count(), 0);

    let mut outcomes = vec![
        finished.recv().await.unwrap().outcome,
        finished.recv().await.unwrap().outcome,
    ];
    outcomes.sort_by_key(|o| *o != RequestOutcome::Aborted);
    assert_eq!(outcomes, vec![RequestOutcome::Aborted, RequestOutcome::Replied]);
}

#[tokio::test]
async fn test_forget_pg_drops_its_sequencers() {
    let (node, _pg) = TestNode::new();
    let conn = connection(1);
    let mut aborted = node.events.subscribe::<SequencerAborted>();

    outcome(node.submit(&conn, write(1, 1, "obj", b"x"))).await;
    let state = node.service.connection(conn.id()).unwrap();
    let sequencer = state.sequencer(PG).unwrap();

    node.service.forget_pg(PG);
    assert!(sequencer.is_aborted());
    assert!(state.sequencer(PG).is_none());
    assert_eq!(aborted.recv().await.unwrap().pgid, PG);
}

#[tokio::test]
async fn test_shutdown_while_waiting_for_map() {
    let (node, pg) = TestNode::new();
    let conn = connection(1);

    let msg = write(1, 1, "obj", b"x").with_epochs(START_EPOCH, START_EPOCH.next());
    let handle = node.submit(&conn, msg);
    reached(&node, RequestState::AwaitingMap).await;

    node.service.shutdown();
    assert_eq!(outcome(handle).await, RequestOutcome::ShutDown);
    assert_eq!(conn.reply_count(), 0);
    assert!(pg.executed().is_empty());
}

#[tokio::test]
async fn test_shutdown_while_resolving_shard() {
    let node = TestNode::empty();
    let conn = connection(1);

    let handle = node.submit(&conn, write(1, 1, "obj", b"x"));
    reached(&node, RequestState::ResolvingShard).await;

    node.service.shutdown();
    assert_eq!(outcome(handle).await, RequestOutcome::ShutDown);
    assert_eq!(conn.reply_count(), 0);
    assert!(node.service.tracker().is_empty());
}

#[tokio::test]
async fn test_shutdown_while_waiting_for_object_lock() {
    let (node, pg) = TestNode::new();
    let holder_conn = connection(1);
    let waiter_conn = connection(2);
    pg.set_exec_delay(Some(Duration::from_secs(30)));

    let holder = node.submit(&holder_conn, write(1, 1, "obj", b"a"));
    reached(&node, RequestState::Executing).await;
    let waiter = node.submit(&waiter_conn, write(2, 1, "obj", b"b"));
    reached(&node, RequestState::AcquiringObjectLock).await;

    node.service.shutdown();
    assert_eq!(outcome(waiter).await, RequestOutcome::ShutDown);
    assert_eq!(outcome(holder).await, RequestOutcome::ShutDown);
    assert_eq!(holder_conn.reply_count(), 0);
    assert_eq!(waiter_conn.reply_count(), 0);
    assert!(pg.executed().is_empty());
}
