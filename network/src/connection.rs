//! Peer connections — outbound request correlation and reply dispatch.
//!
//! Every frame on a channel is a `[counter, gossip]` pair. Outbound
//! requests draw counters from a per-connection sequence whose parity
//! encodes which side initiated the channel (incoming-initiated start at
//! 1, outgoing-initiated at 0, step 2), so both directions allocate
//! correlation ids without coordination. Counter 0 marks an unsolicited
//! push.

use crate::error::NetworkError;
use crate::peer::Peer;
use cinder_gossip::{Codec, Gossip};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Counter for allocating process-wide connection ids.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Buffer of frames waiting for the socket write task.
pub(crate) const OUTBOUND_BUFFER: usize = 64;

/// Handler invoked with the reply to an outbound request. Fires at most
/// once, on a worker distinct from the connection's read path.
pub type ReplyCallback = Box<dyn FnOnce(Gossip) + Send + 'static>;

/// Which side initiated the channel. Determines counter parity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Channel accepted by our server.
    Incoming,
    /// Channel dialed by us.
    Outgoing,
}

impl Direction {
    fn initial_counter(self) -> u64 {
        match self {
            Direction::Incoming => 1,
            Direction::Outgoing => 0,
        }
    }
}

struct Correlation {
    counter: u64,
    pending: HashMap<u64, ReplyCallback>,
    closed: bool,
}

/// A framed bidirectional channel to one peer.
///
/// Owns the outbound frame queue and the correlation table; the socket
/// itself lives in the I/O tasks attached at construction. The delegate
/// back-reference is weak — the owning [`Peer`] may be destroyed while
/// the connection briefly lingers.
pub struct PeerConnection {
    id: u64,
    direction: Direction,
    codec: Arc<Codec>,
    outbound: mpsc::Sender<String>,
    correlation: Mutex<Correlation>,
    delegate: Mutex<Weak<Peer>>,
    on_disconnect: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Create a connection over an already-established outbound frame
    /// channel. The transport layer attaches the socket I/O tasks
    /// afterwards; tests may drive the frame channel directly.
    pub fn new(direction: Direction, codec: Arc<Codec>, outbound: mpsc::Sender<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            codec,
            outbound,
            correlation: Mutex::new(Correlation {
                counter: direction.initial_counter(),
                pending: HashMap::new(),
                closed: false,
            }),
            delegate: Mutex::new(Weak::new()),
            on_disconnect: Mutex::new(None),
            io_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Install the peer this connection reports into.
    pub fn set_delegate(&self, peer: Weak<Peer>) {
        *lock(&self.delegate) = peer;
    }

    /// Install a hook run once when the channel goes away (used by the
    /// server to clean its connection map).
    pub fn set_on_disconnect(&self, hook: Box<dyn FnOnce() + Send>) {
        *lock(&self.on_disconnect) = Some(hook);
    }

    pub(crate) fn attach_io_tasks(&self, tasks: Vec<JoinHandle<()>>) {
        lock(&self.io_tasks).extend(tasks);
    }

    /// Send a request, optionally registering a callback for its reply.
    /// Returns the counter the request went out under.
    pub fn request(
        &self,
        gossip: &Gossip,
        callback: Option<ReplyCallback>,
    ) -> Result<u64, NetworkError> {
        let counter = {
            let mut correlation = lock(&self.correlation);
            if correlation.closed {
                return Err(NetworkError::NotConnected);
            }
            correlation.counter += 2;
            let counter = correlation.counter;
            if let Some(callback) = callback {
                correlation.pending.insert(counter, callback);
            }
            counter
        };

        let frame = self.codec.encode(counter, gossip);
        if self.outbound.try_send(frame).is_err() {
            // Roll back: the request never left, its callback must not
            // linger in the table.
            lock(&self.correlation).pending.remove(&counter);
            return Err(NetworkError::NotConnected);
        }
        Ok(counter)
    }

    /// Send a reply, echoing the request's counter.
    pub fn reply(&self, counter: u64, gossip: &Gossip) -> Result<(), NetworkError> {
        if lock(&self.correlation).closed {
            return Err(NetworkError::NotConnected);
        }
        let frame = self.codec.encode(counter, gossip);
        self.outbound
            .try_send(frame)
            .map_err(|_| NetworkError::NotConnected)
    }

    /// Send an unsolicited frame (counter 0).
    pub fn push(&self, gossip: &Gossip) -> Result<(), NetworkError> {
        self.reply(0, gossip)
    }

    /// Handle one inbound frame. Malformed frames are logged and
    /// dropped; the connection stays open. Replies to pending requests
    /// run their callback, everything else goes to the delegate — both
    /// on spawned workers, off this read path.
    pub fn receive(self: &Arc<Self>, text: &str) {
        let (counter, gossip) = match self.codec.decode(text) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(connection = self.id, %error, "dropping malformed frame");
                return;
            }
        };

        if counter != 0 {
            let callback = lock(&self.correlation).pending.remove(&counter);
            if let Some(callback) = callback {
                tokio::spawn(async move { callback(gossip) });
                return;
            }
        }

        let delegate = lock(&self.delegate).upgrade();
        match delegate {
            Some(peer) => {
                let connection = Arc::clone(self);
                tokio::spawn(async move { peer.deliver(connection, gossip, counter) });
            }
            None => {
                tracing::debug!(
                    connection = self.id,
                    counter,
                    "no delegate for inbound gossip, dropping"
                );
            }
        }
    }

    /// Number of outbound requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        lock(&self.correlation).pending.len()
    }

    /// Whether the channel still accepts frames.
    pub fn is_open(&self) -> bool {
        !lock(&self.correlation).closed
    }

    /// Deliberately close the channel: stop the I/O tasks, drop pending
    /// callbacks (they will never fire), and detach from the server map.
    pub fn close(&self) {
        {
            let mut correlation = lock(&self.correlation);
            correlation.closed = true;
            correlation.pending.clear();
        }
        for task in lock(&self.io_tasks).drain(..) {
            task.abort();
        }
        if let Some(hook) = lock(&self.on_disconnect).take() {
            hook();
        }
    }

    /// Called by the I/O tasks when the socket dies underneath us.
    /// Cleans up like [`close`](Self::close) and additionally tells the
    /// delegate peer the channel is gone.
    pub(crate) fn handle_disconnect(self: &Arc<Self>) {
        {
            let mut correlation = lock(&self.correlation);
            if correlation.closed {
                return;
            }
            correlation.closed = true;
            correlation.pending.clear();
        }
        if let Some(hook) = lock(&self.on_disconnect).take() {
            hook();
        }
        if let Some(peer) = lock(&self.delegate).upgrade() {
            let id = self.id;
            tokio::spawn(async move { peer.connection_lost(id) });
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        for task in lock(&self.io_tasks).drain(..) {
            task.abort();
        }
    }
}

/// Lock a mutex, recovering from poisoning (a panicked holder leaves the
/// guarded data in a state we can still read).
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_gossip::Index;
    use cinder_types::{BlockHash, Timestamp};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn codec() -> Arc<Codec> {
        Arc::new(Codec::new("t", 8))
    }

    fn connection(direction: Direction) -> (Arc<PeerConnection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (PeerConnection::new(direction, codec(), tx), rx)
    }

    #[tokio::test]
    async fn outgoing_counters_are_even_and_monotonic() {
        let (conn, mut rx) = connection(Direction::Outgoing);
        let mut previous = 0;
        for _ in 0..5 {
            let counter = conn.request(&Gossip::Query, None).unwrap();
            assert_eq!(counter % 2, 0);
            assert!(counter > previous);
            previous = counter;
            let frame = rx.recv().await.unwrap();
            assert!(frame.starts_with(&format!("[{counter},")));
        }
    }

    #[tokio::test]
    async fn incoming_counters_are_odd() {
        let (conn, _rx) = connection(Direction::Incoming);
        assert_eq!(conn.request(&Gossip::Query, None).unwrap(), 3);
        assert_eq!(conn.request(&Gossip::Query, None).unwrap(), 5);
    }

    #[tokio::test]
    async fn first_outgoing_counter_is_never_zero() {
        let (conn, _rx) = connection(Direction::Outgoing);
        assert_eq!(conn.request(&Gossip::Query, None).unwrap(), 2);
    }

    #[tokio::test]
    async fn push_uses_counter_zero() {
        let (conn, mut rx) = connection(Direction::Outgoing);
        conn.push(&Gossip::Passive).unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(frame.starts_with("[0,"));
    }

    #[tokio::test]
    async fn reply_echoes_the_counter() {
        let (conn, mut rx) = connection(Direction::Incoming);
        conn.reply(42, &Gossip::Error("not found".into())).unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(frame.starts_with("[42,"));
    }

    #[tokio::test]
    async fn callback_fires_exactly_once_and_is_removed() {
        let (conn, _rx) = connection(Direction::Outgoing);
        let fired = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&fired);
        let counter = conn
            .request(
                &Gossip::Query,
                Some(Box::new(move |_| {
                    sink.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        assert_eq!(conn.pending_requests(), 1);

        let reply = codec().encode(counter, &Gossip::Passive);
        conn.receive(&reply);
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(conn.pending_requests(), 0);

        // A second frame under the same counter has nothing to fire.
        conn.receive(&reply);
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_receives_the_reply_gossip() {
        let (conn, _rx) = connection(Direction::Outgoing);
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let mut reply_tx = Some(reply_tx);
        let counter = conn
            .request(
                &Gossip::Query,
                Some(Box::new(move |gossip| {
                    if let Some(tx) = reply_tx.take() {
                        let _ = tx.send(gossip);
                    }
                })),
            )
            .unwrap();

        let index = Index {
            genesis: BlockHash::new("G"),
            highest: BlockHash::new("H"),
            height: 42,
            timestamp: Timestamp::new(1_700_000_000),
            peers: vec![],
        };
        conn.receive(&codec().encode(counter, &Gossip::Index(index.clone())));
        assert_eq!(reply_rx.await.unwrap(), Gossip::Index(index));
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_the_connection_stays_open() {
        let (conn, _rx) = connection(Direction::Outgoing);
        conn.receive("not a frame");
        conn.receive(r#"[1, {"no_action": true}]"#);
        assert!(conn.is_open());
        assert!(conn.request(&Gossip::Query, None).is_ok());
    }

    #[tokio::test]
    async fn request_after_close_is_not_connected() {
        let (conn, _rx) = connection(Direction::Outgoing);
        conn.close();
        assert!(matches!(
            conn.request(&Gossip::Query, None),
            Err(NetworkError::NotConnected)
        ));
        assert!(matches!(
            conn.push(&Gossip::Passive),
            Err(NetworkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn close_drops_pending_callbacks() {
        let (conn, _rx) = connection(Direction::Outgoing);
        let counter = conn
            .request(&Gossip::Query, Some(Box::new(|_| {})))
            .unwrap();
        assert_eq!(conn.pending_requests(), 1);
        conn.close();
        assert_eq!(conn.pending_requests(), 0);

        // A late reply has no callback left to fire.
        conn.receive(&codec().encode(counter, &Gossip::Passive));
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn send_failure_rolls_back_the_pending_entry() {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let conn = PeerConnection::new(Direction::Outgoing, codec(), tx);
        drop(rx); // channel closed: sends fail
        let result = conn.request(&Gossip::Query, Some(Box::new(|_| {})));
        assert!(matches!(result, Err(NetworkError::NotConnected)));
        assert_eq!(conn.pending_requests(), 0);
    }
}
