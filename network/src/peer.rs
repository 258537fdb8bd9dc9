//! Per-peer lifecycle: state machine, query driver, request handling.

use crate::config::NetworkConfig;
use crate::connection::{lock, Direction, PeerConnection, ReplyCallback, OUTBOUND_BUFFER};
use crate::error::NetworkError;
use crate::node::{Candidate, Node};
use crate::throttle::ThrottlingQueue;
use crate::transport;
use cinder_gossip::{Codec, Gossip, Index, Payload};
use cinder_types::{BlockHash, NodeId, PeerUrl, Timestamp};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Where a peer is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// Never connected, or reset after a failure.
    New { since: Timestamp },
    /// Outbound handshake in flight.
    Connecting { since: Timestamp },
    /// Channel up, not yet queried.
    Connected,
    /// Query request outstanding.
    Querying { since: Timestamp },
    /// Last query succeeded.
    Queried,
    /// Peer exposes no index; do not query it.
    Passive,
    /// Transient failure; retried after the cooldown.
    Failed { error: String, at: Timestamp },
    /// Permanent shun (wrong genesis, self, malformed URL, …).
    Ignored { reason: String },
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::New { .. } => "new",
            PeerState::Connecting { .. } => "connecting",
            PeerState::Connected => "connected",
            PeerState::Querying { .. } => "querying",
            PeerState::Queried => "queried",
            PeerState::Passive => "passive",
            PeerState::Failed { .. } => "failed",
            PeerState::Ignored { .. } => "ignored",
        }
    }
}

/// One inbound request waiting in a peer's throttling queue.
pub struct InboundRequest {
    pub connection: Arc<PeerConnection>,
    pub gossip: Gossip,
    pub counter: u64,
}

struct PeerInner {
    state: PeerState,
    connection: Option<Arc<PeerConnection>>,
    last_seen: Timestamp,
    last_index_request_latency: Option<Duration>,
    time_difference: Option<i64>,
    /// Incremented per outgoing dial; a finished dial whose epoch no
    /// longer matches is stale and must not install its connection.
    connect_epoch: u64,
}

/// One known peer: its URL, its current channel (if any), and the state
/// machine that drives connecting, querying, and retrying.
pub struct Peer {
    url: PeerUrl,
    node: Weak<dyn Node>,
    config: Arc<NetworkConfig>,
    codec: Arc<Codec>,
    inner: Mutex<PeerInner>,
    queue: ThrottlingQueue<InboundRequest>,
}

impl Peer {
    /// Create a peer known only by URL. It will be dialed by
    /// [`advance`](Self::advance).
    pub fn new(url: PeerUrl, node: Weak<dyn Node>, config: Arc<NetworkConfig>) -> Arc<Self> {
        Self::build(url, node, config, None)
    }

    /// Create a peer around an already-established incoming channel.
    pub fn with_connection(
        url: PeerUrl,
        node: Weak<dyn Node>,
        config: Arc<NetworkConfig>,
        connection: Arc<PeerConnection>,
    ) -> Arc<Self> {
        let peer = Self::build(url, node, config, Some(Arc::clone(&connection)));
        connection.set_delegate(Arc::downgrade(&peer));
        peer
    }

    fn build(
        url: PeerUrl,
        node: Weak<dyn Node>,
        config: Arc<NetworkConfig>,
        connection: Option<Arc<PeerConnection>>,
    ) -> Arc<Self> {
        let now = Timestamp::now();
        let state = if connection.is_some() {
            PeerState::Connected
        } else {
            PeerState::New { since: now }
        };
        Arc::new_cyclic(|weak: &Weak<Peer>| {
            let handler = weak.clone();
            let queue = ThrottlingQueue::new(
                config.request_throttle(),
                config.request_queue_limit,
                move |request| {
                    if let Some(peer) = handler.upgrade() {
                        peer.handle_request(request);
                    }
                },
            );
            Peer {
                codec: Arc::new(config.codec()),
                url,
                node,
                config,
                inner: Mutex::new(PeerInner {
                    state,
                    connection,
                    last_seen: now,
                    last_index_request_latency: None,
                    time_difference: None,
                    connect_epoch: 0,
                }),
                queue,
            }
        })
    }

    // -- Accessors -------------------------------------------------------------

    pub fn url(&self) -> &PeerUrl {
        &self.url
    }

    pub fn node_id(&self) -> NodeId {
        self.url.node_id()
    }

    pub fn state(&self) -> PeerState {
        lock(&self.inner).state.clone()
    }

    pub fn last_seen(&self) -> Timestamp {
        lock(&self.inner).last_seen
    }

    /// One-way latency estimate from the last index exchange.
    pub fn last_index_request_latency(&self) -> Option<Duration> {
        lock(&self.inner).last_index_request_latency
    }

    /// Estimated `peer clock − local clock` in seconds.
    pub fn time_difference(&self) -> Option<i64> {
        lock(&self.inner).time_difference
    }

    pub fn connection(&self) -> Option<Arc<PeerConnection>> {
        lock(&self.inner).connection.clone()
    }

    // -- State machine ---------------------------------------------------------

    /// Drive the state machine one step. Called periodically (a poll
    /// cadence of seconds is plenty); `now` is injected so deadlines are
    /// testable. Returns whether an action was taken.
    pub fn advance(self: &Arc<Self>, now: Timestamp) -> bool {
        let mut inner = lock(&self.inner);

        // A vanished connection invalidates every connected-ish state.
        if inner.connection.is_none()
            && matches!(
                inner.state,
                PeerState::Connected
                    | PeerState::Connecting { .. }
                    | PeerState::Queried
                    | PeerState::Querying { .. }
                    | PeerState::Passive
            )
        {
            inner.state = PeerState::New { since: now };
        }

        match inner.state.clone() {
            PeerState::Failed { at, .. } => {
                if at.has_expired(self.config.retry_cooldown_secs, now) {
                    Self::drop_connection(&mut inner);
                    inner.state = PeerState::New { since: at };
                }
                false
            }
            PeerState::New { .. } => {
                if self.url.port() == 0 {
                    Self::shun(&mut inner, "does not accept incoming");
                } else if !self.config.outbound_enabled {
                    Self::shun(&mut inner, "cannot make outgoing connections");
                } else {
                    // The connection object exists from here on; the
                    // socket behind it is dialed on a spawned task and
                    // attached when the handshake completes.
                    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
                    let connection =
                        PeerConnection::new(Direction::Outgoing, Arc::clone(&self.codec), outbound_tx);
                    connection.set_delegate(Arc::downgrade(self));
                    inner.connection = Some(Arc::clone(&connection));
                    inner.state = PeerState::Connecting { since: now };
                    inner.connect_epoch += 1;
                    let epoch = inner.connect_epoch;
                    drop(inner);
                    self.spawn_connect(epoch, connection, outbound_rx);
                }
                true
            }
            PeerState::Connected | PeerState::Queried => {
                drop(inner);
                self.query();
                true
            }
            PeerState::Passive | PeerState::Ignored { .. } => false,
            PeerState::Connecting { since } | PeerState::Querying { since } => {
                if since.has_expired(self.config.retry_cooldown_secs, now) {
                    Self::drop_connection(&mut inner);
                    // Invalidate any dial still in flight, and keep the
                    // original `since` so the total attempt time stays
                    // bounded.
                    inner.connect_epoch += 1;
                    inner.state = PeerState::New { since };
                }
                true
            }
        }
    }

    fn spawn_connect(
        self: &Arc<Self>,
        epoch: u64,
        connection: Arc<PeerConnection>,
        outbound_rx: mpsc::Receiver<String>,
    ) {
        let weak = Arc::downgrade(self);
        let url = self.url.clone();
        let config = Arc::clone(&self.config);
        let node = self.node.clone();
        tokio::spawn(async move {
            let Some(node) = node.upgrade() else { return };
            let local_id = node.node_id();
            let local_port = node.listen_port();
            drop(node);

            let result = transport::dial(&url, local_id, local_port, &config).await;
            let Some(peer) = weak.upgrade() else { return };
            match result {
                Ok(socket) => {
                    let still_current = {
                        let inner = lock(&peer.inner);
                        inner.connect_epoch == epoch
                            && inner.connection.as_ref().map(|c| c.id()) == Some(connection.id())
                    };
                    if still_current {
                        let tasks = transport::spawn_io(socket, &connection, outbound_rx);
                        connection.attach_io_tasks(tasks);
                        peer.handle_connected();
                    } else {
                        tracing::debug!(peer = %peer.node_id(), "discarding stale dial result");
                        connection.close();
                    }
                }
                Err(error) => peer.fail_connect_attempt(epoch, &error),
            }
        });
    }

    fn fail_connect_attempt(&self, epoch: u64, error: &NetworkError) {
        let mut inner = lock(&self.inner);
        if inner.connect_epoch != epoch {
            return;
        }
        tracing::debug!(peer = %self.node_id(), %error, "outgoing connection failed");
        Self::fail_locked(&mut inner, &error.to_string());
    }

    /// Connection event: the channel came up.
    pub fn handle_connected(&self) {
        let mut inner = lock(&self.inner);
        match inner.state {
            PeerState::Connecting { .. } => inner.state = PeerState::Connected,
            ref other => {
                tracing::debug!(
                    peer = %self.node_id(),
                    state = other.name(),
                    "connected event in unexpected state"
                );
            }
        }
    }

    /// Connection event: the identified channel died. Stale events from
    /// superseded connections are ignored.
    pub fn connection_lost(&self, connection_id: u64) {
        let mut inner = lock(&self.inner);
        let current = inner.connection.as_ref().map(|c| c.id());
        if current != Some(connection_id) {
            return;
        }
        inner.connection = None;
        Self::fail_locked(&mut inner, "disconnected");
    }

    /// Transition to `Failed` (unless permanently shunned) and drop the
    /// current connection.
    pub fn fail(&self, error: &str) {
        Self::fail_locked(&mut lock(&self.inner), error);
    }

    fn fail_locked(inner: &mut PeerInner, error: &str) {
        if matches!(inner.state, PeerState::Ignored { .. }) {
            return;
        }
        Self::drop_connection(inner);
        inner.state = PeerState::Failed {
            error: error.to_string(),
            at: Timestamp::now(),
        };
    }

    /// Permanently shun this peer and drop its connection.
    pub fn ignore(&self, reason: &str) {
        Self::shun(&mut lock(&self.inner), reason);
    }

    fn shun(inner: &mut PeerInner, reason: &str) {
        if matches!(inner.state, PeerState::Ignored { .. }) {
            return;
        }
        Self::drop_connection(inner);
        inner.state = PeerState::Ignored {
            reason: reason.to_string(),
        };
    }

    fn drop_connection(inner: &mut PeerInner) {
        if let Some(connection) = inner.connection.take() {
            connection.close();
        }
    }

    // -- Query driver ----------------------------------------------------------

    /// Ask the peer for its chain index.
    pub fn query(self: &Arc<Self>) {
        let connection = {
            let mut inner = lock(&self.inner);
            let Some(connection) = inner.connection.clone() else {
                Self::fail_locked(&mut inner, "not connected");
                return;
            };
            inner.state = PeerState::Querying {
                since: Timestamp::now(),
            };
            connection
        };

        let weak = Arc::downgrade(self);
        let connection_id = connection.id();
        let sent_at = Instant::now();
        let callback: ReplyCallback = Box::new(move |reply| {
            if let Some(peer) = weak.upgrade() {
                peer.handle_query_reply(connection_id, sent_at, reply);
            }
        });

        if let Err(error) = connection.request(&Gossip::Query, Some(callback)) {
            self.fail(&error.to_string());
        }
    }

    fn handle_query_reply(self: &Arc<Self>, connection_id: u64, sent_at: Instant, reply: Gossip) {
        let Some(node) = self.node.upgrade() else { return };
        let now = Timestamp::now();

        let mut inner = lock(&self.inner);
        if inner.connection.as_ref().map(|c| c.id()) != Some(connection_id) {
            tracing::debug!(peer = %self.node_id(), "dropping reply from a superseded connection");
            return;
        }
        inner.last_seen = now;
        inner.last_index_request_latency = Some(sent_at.elapsed() / 2);

        match reply {
            Gossip::Index(index) => {
                let local_genesis = {
                    let chain = node.chain();
                    let chain = lock(&chain);
                    chain.genesis()
                };
                if index.genesis != local_genesis {
                    Self::shun(&mut inner, "believes in other genesis");
                    return;
                }
                inner.state = PeerState::Queried;
                inner.time_difference = Some(index.timestamp.signed_delta(now));
                drop(inner);

                for url in &index.peers {
                    node.add_peer(url);
                }
                node.receive_best(Candidate {
                    hash: index.highest,
                    height: index.height,
                    peer: self.node_id(),
                });
            }
            Gossip::Passive => {
                inner.state = PeerState::Passive;
            }
            other => {
                drop(inner);
                tracing::warn!(
                    peer = %self.node_id(),
                    action = other.action(),
                    "invalid reply to query"
                );
                self.fail("invalid reply to query");
            }
        }
    }

    // -- Fetch driver & dissemination ------------------------------------------

    /// Request a block (plus up to `extra` ancestors) from this peer.
    /// Returned blocks are fed to the node flagged as requested.
    pub fn fetch_block(self: &Arc<Self>, hash: BlockHash, extra: u32) -> Result<u64, NetworkError> {
        let connection = self.connection().ok_or(NetworkError::NotConnected)?;
        let weak = Arc::downgrade(self);
        let callback: ReplyCallback = Box::new(move |reply| {
            let Some(peer) = weak.upgrade() else { return };
            let Some(node) = peer.node.upgrade() else { return };
            match reply {
                Gossip::Result { block, extra } => {
                    if node.receive_block(block, peer.node_id(), true).is_err() {
                        peer.fail("received invalid fetched block");
                        return;
                    }
                    for (hash, payload) in extra {
                        if node.receive_block(payload, peer.node_id(), true).is_err() {
                            tracing::warn!(
                                peer = %peer.node_id(),
                                %hash,
                                "fetched ancestor rejected by ledger"
                            );
                        }
                    }
                }
                Gossip::Error(message) => {
                    tracing::debug!(peer = %peer.node_id(), %message, "fetch answered with an error");
                }
                _ => peer.fail("invalid reply to fetch"),
            }
        });
        connection.request(&Gossip::Fetch { hash, extra }, Some(callback))
    }

    /// Push an unsolicited block to this peer.
    pub fn publish_block(&self, block: Payload) -> Result<(), NetworkError> {
        self.connection()
            .ok_or(NetworkError::NotConnected)?
            .push(&Gossip::Block(block))
    }

    /// Push an unsolicited transaction to this peer.
    pub fn publish_transaction(&self, tx: Payload) -> Result<(), NetworkError> {
        self.connection()
            .ok_or(NetworkError::NotConnected)?
            .push(&Gossip::Transaction(tx))
    }

    // -- Inbound requests ------------------------------------------------------

    /// Called by the connection's delegate dispatch for every inbound
    /// frame that is not a reply. Stamps `last_seen` and queues the
    /// request; the throttling queue sheds under pressure.
    pub fn deliver(&self, connection: Arc<PeerConnection>, gossip: Gossip, counter: u64) {
        lock(&self.inner).last_seen = Timestamp::now();
        let accepted = self.queue.enqueue(InboundRequest {
            connection,
            gossip,
            counter,
        });
        if !accepted {
            tracing::warn!(peer = %self.node_id(), "inbound request queue full, dropping request");
        }
    }

    /// Drained from the throttling queue, one request at a time.
    fn handle_request(self: &Arc<Self>, request: InboundRequest) {
        let Some(node) = self.node.upgrade() else { return };
        let InboundRequest {
            connection,
            gossip,
            counter,
        } = request;

        match gossip {
            Gossip::Forget => {
                node.forget_peer(self.node_id());
                self.ignore("peer requested to be forgotten");
            }
            Gossip::Transaction(tx) => {
                if let Err(error) = node.receive_transaction(tx, self.node_id()) {
                    self.fail(&error.to_string());
                }
            }
            Gossip::Block(block) => {
                if node.receive_block(block, self.node_id(), false).is_err() {
                    self.fail("received invalid unsolicited block");
                }
            }
            Gossip::Fetch { hash, extra } => {
                self.handle_fetch(&*node, &connection, counter, hash, extra);
            }
            Gossip::Query => {
                self.handle_index_request(&*node, &connection, counter);
            }
            other => {
                tracing::warn!(
                    peer = %self.node_id(),
                    action = other.action(),
                    "peer sent a reply-shaped gossip as a request"
                );
                self.ignore("peer sent invalid request");
            }
        }
    }

    fn handle_fetch(
        &self,
        node: &dyn Node,
        connection: &Arc<PeerConnection>,
        counter: u64,
        hash: BlockHash,
        extra: u32,
    ) {
        if extra as usize > self.config.max_extra_blocks {
            self.fail("limit exceeded");
            return;
        }

        let reply = {
            let chain = node.chain();
            let chain = lock(&chain);
            match chain.block(&hash) {
                None => Gossip::Error("not found".into()),
                Some(block) => {
                    // Walk predecessors, stopping at genesis or a
                    // missing link.
                    let mut ancestors = BTreeMap::new();
                    let mut cursor = block.previous.clone();
                    while ancestors.len() < extra as usize {
                        let Some(prev_hash) = cursor else { break };
                        let Some(prev) = chain.block(&prev_hash) else { break };
                        cursor = prev.previous;
                        ancestors.insert(prev_hash, prev.payload);
                    }
                    Gossip::Result {
                        block: block.payload,
                        extra: ancestors,
                    }
                }
            }
        };

        if let Err(error) = connection.reply(counter, &reply) {
            self.fail(&error.to_string());
        }
    }

    fn handle_index_request(&self, node: &dyn Node, connection: &Arc<PeerConnection>, counter: u64) {
        let index = {
            let chain = node.chain();
            let chain = lock(&chain);
            let head = chain.head();
            Index {
                genesis: chain.genesis(),
                highest: head.hash,
                height: head.height,
                timestamp: node.median_network_time(),
                peers: node
                    .valid_peers()
                    .iter()
                    .map(|url| url.to_string())
                    .collect(),
            }
        };
        if let Err(error) = connection.reply(counter, &Gossip::Index(index)) {
            self.fail(&error.to_string());
        }
    }
}
