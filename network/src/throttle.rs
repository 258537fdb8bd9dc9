//! Per-peer inbound request throttling.
//!
//! A bounded FIFO drained by a single worker at a minimum inter-item
//! interval. Keeps one peer from saturating the node with requests and
//! bounds queueing memory. When the queue is full the arriving item is
//! shed; the already-accepted backlog keeps its order.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Bounded FIFO with a paced single-worker drain.
///
/// The handler runs serially: the worker waits until `interval` has
/// elapsed since the *start* of the previous invocation before handling
/// the next item. Dropping the queue aborts the worker; queued items are
/// discarded.
pub struct ThrottlingQueue<T> {
    tx: mpsc::Sender<T>,
    worker: JoinHandle<()>,
}

impl<T: Send + 'static> ThrottlingQueue<T> {
    /// Create a queue holding at most `max_queued` items, drained by
    /// `handler` no faster than one item per `interval`.
    ///
    /// Must be called from within a tokio runtime (the worker is spawned
    /// immediately).
    pub fn new(
        interval: Duration,
        max_queued: usize,
        mut handler: impl FnMut(T) + Send + 'static,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel(max_queued.max(1));
        let worker = tokio::spawn(async move {
            let mut last_start: Option<Instant> = None;
            loop {
                if let Some(prev) = last_start {
                    tokio::time::sleep_until(prev + interval).await;
                }
                let Some(item) = rx.recv().await else { break };
                last_start = Some(Instant::now());
                handler(item);
            }
        });
        Self { tx, worker }
    }

    /// Append an item. Returns `false` when the queue is full and the
    /// item was shed, or when the worker is gone.
    pub fn enqueue(&self, item: T) -> bool {
        self.tx.try_send(item).is_ok()
    }
}

impl<T> Drop for ThrottlingQueue<T> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
