//! End-to-end gossip scenarios: two nodes wired over in-process
//! connection pairs exchange queries, fetches, and pushes, plus live
//! WebSocket tests for the channel handshake.

use cinder_gossip::{Gossip, Payload};
use cinder_network::{
    Candidate, ChainBlock, ChainHead, ChainView, Direction, GossipServer, IncomingHandshake,
    NetworkConfig, Node, NodeError, Peer, PeerConnection, PeerState, SharedChain,
};
use cinder_types::{BlockHash, NodeId, PeerUrl, Timestamp};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

struct TestChain {
    genesis: BlockHash,
    head: ChainHead,
    blocks: HashMap<BlockHash, ChainBlock>,
}

impl TestChain {
    /// A chain with no stored blocks, just a genesis and a head summary.
    fn summary(genesis: &str, highest: &str, height: u64) -> Self {
        Self {
            genesis: BlockHash::new(genesis),
            head: ChainHead {
                hash: BlockHash::new(highest),
                height,
            },
            blocks: HashMap::new(),
        }
    }

    /// A fully linked chain `H0` (genesis) … `H<height>` (head), each
    /// block carrying its index as payload.
    fn linear(height: u64) -> Self {
        let mut blocks = HashMap::new();
        for n in 0..=height {
            let hash = BlockHash::new(format!("H{n}"));
            let previous = (n > 0).then(|| BlockHash::new(format!("H{}", n - 1)));
            let mut payload = Payload::new();
            payload.insert("n".into(), json!(n));
            blocks.insert(
                hash.clone(),
                ChainBlock {
                    hash,
                    previous,
                    payload,
                },
            );
        }
        Self {
            genesis: BlockHash::new("H0"),
            head: ChainHead {
                hash: BlockHash::new(format!("H{height}")),
                height,
            },
            blocks,
        }
    }
}

impl ChainView for TestChain {
    fn genesis(&self) -> BlockHash {
        self.genesis.clone()
    }
    fn head(&self) -> ChainHead {
        self.head.clone()
    }
    fn block(&self, hash: &BlockHash) -> Option<ChainBlock> {
        self.blocks.get(hash).cloned()
    }
}

/// Scripted node collaborator recording everything the core reports.
struct TestNode {
    id: NodeId,
    port: u16,
    chain: SharedChain,
    config: Arc<NetworkConfig>,
    network_time: Mutex<Timestamp>,
    advertised: Mutex<Vec<PeerUrl>>,
    reject_payloads: AtomicBool,
    added_peers: Mutex<Vec<String>>,
    best: Mutex<Vec<Candidate>>,
    forgotten: Mutex<Vec<NodeId>>,
    blocks: Mutex<Vec<(Payload, NodeId, bool)>>,
    transactions: Mutex<Vec<(Payload, NodeId)>>,
    incoming_peers: Mutex<Vec<Arc<Peer>>>,
    self_ref: Mutex<Weak<TestNode>>,
}

impl TestNode {
    fn new(chain: TestChain, port: u16, config: &Arc<NetworkConfig>) -> Arc<Self> {
        let node = Arc::new(Self {
            id: NodeId::generate(),
            port,
            chain: Arc::new(Mutex::new(chain)),
            config: Arc::clone(config),
            network_time: Mutex::new(Timestamp::now()),
            advertised: Mutex::new(Vec::new()),
            reject_payloads: AtomicBool::new(false),
            added_peers: Mutex::new(Vec::new()),
            best: Mutex::new(Vec::new()),
            forgotten: Mutex::new(Vec::new()),
            blocks: Mutex::new(Vec::new()),
            transactions: Mutex::new(Vec::new()),
            incoming_peers: Mutex::new(Vec::new()),
            self_ref: Mutex::new(Weak::new()),
        });
        *node.self_ref.lock().unwrap() = Arc::downgrade(&node);
        node
    }

    fn weak(self: &Arc<Self>) -> Weak<TestNode> {
        Arc::downgrade(self)
    }

    fn set_network_time(&self, time: Timestamp) {
        *self.network_time.lock().unwrap() = time;
    }

    fn reject_payloads(&self) {
        self.reject_payloads.store(true, Ordering::SeqCst);
    }

    fn received_blocks(&self) -> Vec<(Payload, NodeId, bool)> {
        self.blocks.lock().unwrap().clone()
    }
}

impl Node for TestNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn listen_port(&self) -> u16 {
        self.port
    }

    fn add_peer(&self, url: &str) {
        self.added_peers.lock().unwrap().push(url.to_string());
    }

    fn add_incoming_peer(&self, connection: Arc<PeerConnection>, handshake: IncomingHandshake) {
        let Some(node_id) = handshake.node_id else {
            connection.close();
            return;
        };
        let url = PeerUrl::from_parts(
            "ws",
            node_id,
            &handshake.remote_host,
            handshake.port.unwrap_or(0),
        );
        let Ok(url) = url else {
            connection.close();
            return;
        };
        let weak = self.self_ref.lock().unwrap().clone();
        let peer = Peer::with_connection(url, weak, Arc::clone(&self.config), connection);
        self.incoming_peers.lock().unwrap().push(peer);
    }

    fn forget_peer(&self, peer: NodeId) {
        self.forgotten.lock().unwrap().push(peer);
    }

    fn receive_best(&self, candidate: Candidate) {
        self.best.lock().unwrap().push(candidate);
    }

    fn receive_transaction(&self, tx: Payload, from: NodeId) -> Result<(), NodeError> {
        if self.reject_payloads.load(Ordering::SeqCst) {
            return Err(NodeError::InvalidTransaction("bad signature".into()));
        }
        self.transactions.lock().unwrap().push((tx, from));
        Ok(())
    }

    fn receive_block(
        &self,
        block: Payload,
        from: NodeId,
        was_requested: bool,
    ) -> Result<(), NodeError> {
        if self.reject_payloads.load(Ordering::SeqCst) {
            return Err(NodeError::InvalidBlock("bad signature".into()));
        }
        self.blocks.lock().unwrap().push((block, from, was_requested));
        Ok(())
    }

    fn valid_peers(&self) -> Vec<PeerUrl> {
        self.advertised.lock().unwrap().clone()
    }

    fn chain(&self) -> SharedChain {
        Arc::clone(&self.chain)
    }

    fn median_network_time(&self) -> Timestamp {
        *self.network_time.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> Arc<NetworkConfig> {
    Arc::new(NetworkConfig {
        request_throttle_ms: 1,
        ..NetworkConfig::default()
    })
}

/// Wire two nodes together over an in-process frame pair: `x` plays the
/// dialing side, `y` the accepting side. Returns (x's peer entry for y,
/// y's peer entry for x).
fn link(
    node_x: &Arc<TestNode>,
    node_y: &Arc<TestNode>,
    config: &Arc<NetworkConfig>,
) -> (Arc<Peer>, Arc<Peer>) {
    let codec = Arc::new(config.codec());
    let (x_tx, mut x_rx) = mpsc::channel(64);
    let (y_tx, mut y_rx) = mpsc::channel(64);
    let conn_x = PeerConnection::new(Direction::Outgoing, Arc::clone(&codec), x_tx);
    let conn_y = PeerConnection::new(Direction::Incoming, codec, y_tx);

    {
        let conn_y = Arc::clone(&conn_y);
        tokio::spawn(async move {
            while let Some(frame) = x_rx.recv().await {
                conn_y.receive(&frame);
            }
        });
    }
    {
        let conn_x = Arc::clone(&conn_x);
        tokio::spawn(async move {
            while let Some(frame) = y_rx.recv().await {
                conn_x.receive(&frame);
            }
        });
    }

    let url_y = PeerUrl::from_parts("ws", node_y.id, "127.0.0.1", 9001).unwrap();
    let url_x = PeerUrl::from_parts("ws", node_x.id, "127.0.0.1", 9002).unwrap();
    let peer_y_on_x = Peer::with_connection(url_y, node_x.weak(), Arc::clone(config), conn_x);
    let peer_x_on_y = Peer::with_connection(url_x, node_y.weak(), Arc::clone(config), conn_y);
    (peer_y_on_x, peer_x_on_y)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn payload_n(payload: &Payload) -> u64 {
    payload.get("n").and_then(|v| v.as_u64()).expect("payload index")
}

// ---------------------------------------------------------------------------
// Query / index exchange
// ---------------------------------------------------------------------------

#[tokio::test]
async fn query_index_exchange() {
    let config = test_config();
    let node_a = TestNode::new(TestChain::summary("G", "X", 7), 9002, &config);
    let node_b = TestNode::new(TestChain::summary("G", "H", 42), 9001, &config);
    node_b.set_network_time(Timestamp::new(1_700_000_000));

    let (peer_b, _peer_a) = link(&node_a, &node_b, &config);

    peer_b.query();
    wait_until("query to complete", || peer_b.state() == PeerState::Queried).await;

    let best = node_a.best.lock().unwrap().clone();
    assert_eq!(
        best,
        vec![Candidate {
            hash: BlockHash::new("H"),
            height: 42,
            peer: node_b.id,
        }]
    );

    let expected = 1_700_000_000i64 - Timestamp::now().as_secs() as i64;
    let diff = peer_b.time_difference().expect("time difference estimated");
    assert!((diff - expected).abs() <= 2, "time difference {diff} vs {expected}");
    assert!(peer_b.last_index_request_latency().is_some());
}

#[tokio::test]
async fn index_reply_registers_advertised_peers() {
    let config = test_config();
    let node_a = TestNode::new(TestChain::summary("G", "X", 7), 9002, &config);
    let node_b = TestNode::new(TestChain::summary("G", "H", 42), 9001, &config);
    let third = PeerUrl::from_parts("ws", NodeId::generate(), "10.0.0.9", 7777).unwrap();
    node_b.advertised.lock().unwrap().push(third.clone());

    let (peer_b, _peer_a) = link(&node_a, &node_b, &config);
    peer_b.query();
    wait_until("query to complete", || peer_b.state() == PeerState::Queried).await;

    assert_eq!(*node_a.added_peers.lock().unwrap(), vec![third.to_string()]);
}

#[tokio::test]
async fn wrong_genesis_shuns_the_peer_without_reporting() {
    let config = test_config();
    let node_a = TestNode::new(TestChain::summary("G", "X", 7), 9002, &config);
    let node_b = TestNode::new(TestChain::summary("G2", "H", 42), 9001, &config);
    let third = PeerUrl::from_parts("ws", NodeId::generate(), "10.0.0.9", 7777).unwrap();
    node_b.advertised.lock().unwrap().push(third);

    let (peer_b, _peer_a) = link(&node_a, &node_b, &config);
    peer_b.query();
    wait_until("peer to be shunned", || {
        matches!(peer_b.state(), PeerState::Ignored { .. })
    })
    .await;

    assert!(matches!(
        peer_b.state(),
        PeerState::Ignored { reason } if reason == "believes in other genesis"
    ));
    assert!(peer_b.connection().is_none());
    assert!(node_a.best.lock().unwrap().is_empty());
    assert!(node_a.added_peers.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_returns_the_block_and_its_ancestors() {
    let config = test_config();
    let node_x = TestNode::new(TestChain::summary("H0", "X", 1), 9002, &config);
    let node_y = TestNode::new(TestChain::linear(5), 9001, &config);

    let (peer_y, _peer_x) = link(&node_x, &node_y, &config);
    peer_y.fetch_block(BlockHash::new("H5"), 3).unwrap();
    wait_until("fetched blocks to arrive", || node_x.received_blocks().len() == 4).await;

    let blocks = node_x.received_blocks();
    assert!(blocks.iter().all(|(_, from, requested)| {
        *from == node_y.id && *requested
    }));
    let mut ns: Vec<u64> = blocks.iter().map(|(p, _, _)| payload_n(p)).collect();
    ns.sort_unstable();
    assert_eq!(ns, vec![2, 3, 4, 5]);
}

#[tokio::test]
async fn fetch_walk_stops_at_genesis() {
    let config = test_config();
    let node_x = TestNode::new(TestChain::summary("H0", "X", 1), 9002, &config);
    let node_y = TestNode::new(TestChain::linear(5), 9001, &config);

    let (peer_y, _peer_x) = link(&node_x, &node_y, &config);
    peer_y.fetch_block(BlockHash::new("H5"), 10).unwrap();
    wait_until("fetched blocks to arrive", || node_x.received_blocks().len() == 6).await;

    let mut ns: Vec<u64> = node_x
        .received_blocks()
        .iter()
        .map(|(p, _, _)| payload_n(p))
        .collect();
    ns.sort_unstable();
    assert_eq!(ns, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn fetch_of_an_unknown_block_is_answered_with_an_error() {
    let config = test_config();
    let node_x = TestNode::new(TestChain::summary("H0", "X", 1), 9002, &config);
    let node_y = TestNode::new(TestChain::linear(2), 9001, &config);

    let (peer_y, peer_x) = link(&node_x, &node_y, &config);
    peer_y.fetch_block(BlockHash::new("H9"), 0).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(node_x.received_blocks().is_empty());
    // An error reply is not a peer failure on either side.
    assert_eq!(peer_y.state(), PeerState::Connected);
    assert_eq!(peer_x.state(), PeerState::Connected);
}

#[tokio::test]
async fn oversized_fetch_fails_the_serving_peer() {
    let config = test_config();
    let node_x = TestNode::new(TestChain::summary("H0", "X", 1), 9002, &config);
    let node_y = TestNode::new(TestChain::linear(5), 9001, &config);

    let (peer_y, peer_x) = link(&node_x, &node_y, &config);
    let over_limit = config.max_extra_blocks as u32 + 1;
    peer_y.fetch_block(BlockHash::new("H5"), over_limit).unwrap();

    wait_until("serving peer to fail", || {
        matches!(peer_x.state(), PeerState::Failed { .. })
    })
    .await;
    assert!(matches!(
        peer_x.state(),
        PeerState::Failed { error, .. } if error == "limit exceeded"
    ));
    assert!(peer_x.connection().is_none());
    assert!(node_x.received_blocks().is_empty());
}

// ---------------------------------------------------------------------------
// Dissemination & forget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn published_blocks_and_transactions_reach_the_node() {
    let config = test_config();
    let node_x = TestNode::new(TestChain::summary("G", "X", 1), 9002, &config);
    let node_y = TestNode::new(TestChain::summary("G", "H", 2), 9001, &config);

    let (peer_y, _peer_x) = link(&node_x, &node_y, &config);

    let mut block = Payload::new();
    block.insert("n".into(), json!(8));
    peer_y.publish_block(block).unwrap();

    let mut tx = Payload::new();
    tx.insert("amount".into(), json!(5));
    peer_y.publish_transaction(tx).unwrap();

    wait_until("block to arrive", || !node_y.received_blocks().is_empty()).await;
    wait_until("tx to arrive", || !node_y.transactions.lock().unwrap().is_empty()).await;

    let blocks = node_y.received_blocks();
    assert_eq!(blocks[0].1, node_x.id);
    assert!(!blocks[0].2, "pushed blocks are not marked as requested");
    assert_eq!(node_y.transactions.lock().unwrap()[0].1, node_x.id);
}

#[tokio::test]
async fn invalid_unsolicited_block_fails_the_peer() {
    let config = test_config();
    let node_x = TestNode::new(TestChain::summary("G", "X", 1), 9002, &config);
    let node_y = TestNode::new(TestChain::summary("G", "H", 2), 9001, &config);
    node_y.reject_payloads();

    let (peer_y, peer_x) = link(&node_x, &node_y, &config);
    let mut block = Payload::new();
    block.insert("n".into(), json!(9));
    peer_y.publish_block(block).unwrap();

    wait_until("receiving peer to fail", || {
        matches!(peer_x.state(), PeerState::Failed { .. })
    })
    .await;
    assert!(matches!(
        peer_x.state(),
        PeerState::Failed { error, .. } if error == "received invalid unsolicited block"
    ));
}

#[tokio::test]
async fn forget_request_is_honored() {
    let config = test_config();
    let node_x = TestNode::new(TestChain::summary("G", "X", 1), 9002, &config);
    let node_y = TestNode::new(TestChain::summary("G", "H", 2), 9001, &config);

    let (peer_y, peer_x) = link(&node_x, &node_y, &config);
    peer_y.connection().unwrap().push(&Gossip::Forget).unwrap();

    wait_until("forget to land", || !node_y.forgotten.lock().unwrap().is_empty()).await;
    assert_eq!(*node_y.forgotten.lock().unwrap(), vec![node_x.id]);
    assert!(matches!(
        peer_x.state(),
        PeerState::Ignored { reason } if reason == "peer requested to be forgotten"
    ));
}

// ---------------------------------------------------------------------------
// Throttling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbound_queries_are_paced_by_the_throttle() {
    let interval = Duration::from_millis(40);
    let config = Arc::new(NetworkConfig {
        request_throttle_ms: interval.as_millis() as u64,
        ..NetworkConfig::default()
    });
    let node = TestNode::new(TestChain::summary("G", "H", 2), 9001, &config);

    let codec = Arc::new(config.codec());
    let (tx, mut outbound) = mpsc::channel(64);
    let connection = PeerConnection::new(Direction::Incoming, codec, tx);
    let url = PeerUrl::from_parts("ws", NodeId::generate(), "127.0.0.1", 9002).unwrap();
    let peer = Peer::with_connection(url, node.weak(), Arc::clone(&config), connection);
    let connection = peer.connection().unwrap();

    let start = std::time::Instant::now();
    for counter in [2u64, 4, 6, 8] {
        peer.deliver(Arc::clone(&connection), Gossip::Query, counter);
    }
    for _ in 0..4 {
        tokio::time::timeout(Duration::from_secs(2), outbound.recv())
            .await
            .expect("reply in time")
            .expect("reply frame");
    }
    // 4 handler invocations with a 40ms floor between starts.
    assert!(start.elapsed() >= interval * 3);
}

// ---------------------------------------------------------------------------
// WebSocket handshake
// ---------------------------------------------------------------------------

async fn bind_server(node: &Arc<TestNode>, config: &Arc<NetworkConfig>) -> Arc<GossipServer> {
    let server = GossipServer::bind(0, node.weak(), Arc::clone(config))
        .await
        .expect("bind");
    tokio::spawn(Arc::clone(&server).run());
    server
}

#[tokio::test]
async fn server_accepts_matching_protocol_and_creates_the_peer() {
    let config = test_config();
    let node = TestNode::new(TestChain::summary("G", "H", 2), 9001, &config);
    let server = bind_server(&node, &config).await;

    let remote_id = NodeId::generate();
    let url = format!(
        "ws://127.0.0.1:{}/?uuid={remote_id}&port=4242",
        server.port()
    );
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static("cinder-v1"),
    );
    let (socket, response) = tokio_tungstenite::connect_async(request).await.expect("accepted");
    assert_eq!(
        response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok()),
        Some("cinder-v1")
    );

    wait_until("incoming peer to be registered", || {
        !node.incoming_peers.lock().unwrap().is_empty()
    })
    .await;
    {
        let peers = node.incoming_peers.lock().unwrap();
        assert_eq!(peers[0].node_id(), remote_id);
        assert_eq!(peers[0].url().port(), 4242);
        assert_eq!(peers[0].state(), PeerState::Connected);
    }
    assert_eq!(server.connection_count(), 1);

    // Dropping the socket cleans the connection map and fails the peer.
    drop(socket);
    wait_until("connection map to empty", || server.connection_count() == 0).await;
    wait_until("peer to notice the disconnect", || {
        let peers = node.incoming_peers.lock().unwrap();
        matches!(peers[0].state(), PeerState::Failed { .. })
    })
    .await;
}

#[tokio::test]
async fn server_rejects_wrong_or_missing_protocol() {
    let config = test_config();
    let node = TestNode::new(TestChain::summary("G", "H", 2), 9001, &config);
    let server = bind_server(&node, &config).await;

    // Wrong subprotocol.
    let url = format!("ws://127.0.0.1:{}/", server.port());
    let mut request = url.clone().into_client_request().unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static("cinder-v0"),
    );
    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    // No subprotocol at all.
    let request = url.into_client_request().unwrap();
    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connection_count(), 0);
    assert!(node.incoming_peers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn outgoing_dial_queries_over_a_live_socket() {
    let config = test_config();
    let node_y = TestNode::new(TestChain::summary("G", "H", 42), 9001, &config);
    let server = bind_server(&node_y, &config).await;

    let node_x = TestNode::new(TestChain::summary("G", "X", 7), 4242, &config);
    let url_y = PeerUrl::from_parts("ws", node_y.id, "127.0.0.1", server.port()).unwrap();
    let peer_y = Peer::new(url_y, node_x.weak(), Arc::clone(&config));

    assert!(peer_y.advance(Timestamp::now()));
    wait_until("channel to come up", || peer_y.state() == PeerState::Connected).await;

    // Y learned X's identity from the upgrade query parameters.
    wait_until("symmetric peer entry", || {
        !node_y.incoming_peers.lock().unwrap().is_empty()
    })
    .await;
    {
        let peers = node_y.incoming_peers.lock().unwrap();
        assert_eq!(peers[0].node_id(), node_x.id);
        assert_eq!(peers[0].url().port(), 4242);
    }

    // The next poll queries, and the index exchange completes.
    assert!(peer_y.advance(Timestamp::now()));
    wait_until("query to complete", || peer_y.state() == PeerState::Queried).await;
    let best = node_x.best.lock().unwrap().clone();
    assert_eq!(
        best,
        vec![Candidate {
            hash: BlockHash::new("H"),
            height: 42,
            peer: node_y.id,
        }]
    );
}
