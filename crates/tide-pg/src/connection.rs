//! In-memory client connection.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tide_types::{ConnectionId, Reply};
use tokio::sync::watch;
use tracing::trace;

use crate::error::PgError;
use crate::traits::Connection;

/// Connection that records every reply sent on it.
pub struct MemoryConnection {
    id: ConnectionId,
    replies: Mutex<Vec<Reply>>,
    sent: watch::Sender<usize>,
    closed: AtomicBool,
}

impl MemoryConnection {
    /// Create an open connection.
    pub fn new(id: ConnectionId) -> Self {
        let (sent, _) = watch::channel(0);
        Self {
            id,
            replies: Mutex::new(Vec::new()),
            sent,
            closed: AtomicBool::new(false),
        }
    }

    /// Close the connection; later sends fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Every reply sent so far, in send order.
    pub fn replies(&self) -> Vec<Reply> {
        self.replies.lock().expect("replies lock poisoned").clone()
    }

    /// Number of replies sent so far.
    pub fn reply_count(&self) -> usize {
        *self.sent.borrow()
    }

    /// Wait until at least `n` replies have been sent.
    pub async fn wait_for_replies(&self, n: usize) {
        let mut rx = self.sent.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, reply: Reply) -> Result<(), PgError> {
        if self.is_closed() {
            return Err(PgError::ConnectionClosed);
        }
        trace!(conn = %self.id, reqid = %reply.reqid(), "reply sent");
        self.replies
            .lock()
            .expect("replies lock poisoned")
            .push(reply);
        self.sent.send_modify(|count| *count += 1);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
