//! Collaborator surface consumed by the gossip core.
//!
//! The node itself (peer bookkeeping, chain selection, mining hooks) and
//! the ledger live outside this crate; the core reaches them through
//! these traits. Implementations are injected at construction and must
//! be cheap to call: the core may invoke [`Node`] methods while it holds
//! a peer mutex or the shared chain mutex, so implementations must not
//! acquire either of those from inside these callbacks.

use crate::connection::PeerConnection;
use crate::error::NodeError;
use crate::transport::IncomingHandshake;
use cinder_gossip::Payload;
use cinder_types::{BlockHash, NodeId, PeerUrl, Timestamp};
use std::sync::{Arc, Mutex};

/// A potential better chain head reported by a peer's index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub hash: BlockHash,
    pub height: u64,
    pub peer: NodeId,
}

/// The longest chain's head.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainHead {
    pub hash: BlockHash,
    pub height: u64,
}

/// A block as seen through the chain view: its hash, its predecessor
/// link (absent on the genesis block), and its opaque wire payload.
#[derive(Clone, Debug)]
pub struct ChainBlock {
    pub hash: BlockHash,
    pub previous: Option<BlockHash>,
    pub payload: Payload,
}

/// Read view of the ledger's longest chain.
pub trait ChainView: Send {
    /// The genesis signature every peer must agree on.
    fn genesis(&self) -> BlockHash;

    /// Head of the longest chain.
    fn head(&self) -> ChainHead;

    /// Look up a block on the longest chain by hash.
    fn block(&self, hash: &BlockHash) -> Option<ChainBlock>;
}

/// The coarse ledger mutex. Every chain read/traversal sequence holds it
/// for its whole duration; lock order is always peer → ledger.
pub type SharedChain = Arc<Mutex<dyn ChainView>>;

/// The node collaborator the core reports into.
pub trait Node: Send + Sync {
    /// This node's identity.
    fn node_id(&self) -> NodeId;

    /// The port this node accepts incoming channels on (0 when purely
    /// passive).
    fn listen_port(&self) -> u16;

    /// A peer URL was learned from another peer's index. The node
    /// decides whether to track it; malformed URLs become shunned peers.
    fn add_peer(&self, url: &str);

    /// An incoming channel was accepted; the node creates (or rebinds)
    /// the symmetric peer entry for it.
    fn add_incoming_peer(&self, connection: Arc<PeerConnection>, handshake: IncomingHandshake);

    /// A peer asked to be forgotten.
    fn forget_peer(&self, peer: NodeId);

    /// A peer advertised a chain head worth considering.
    fn receive_best(&self, candidate: Candidate);

    /// A peer pushed a transaction.
    fn receive_transaction(&self, tx: Payload, from: NodeId) -> Result<(), NodeError>;

    /// A peer delivered a block, either unsolicited or as a fetch reply.
    fn receive_block(
        &self,
        block: Payload,
        from: NodeId,
        was_requested: bool,
    ) -> Result<(), NodeError>;

    /// Peer URLs fit for advertisement in index replies.
    fn valid_peers(&self) -> Vec<PeerUrl>;

    /// The shared ledger view.
    fn chain(&self) -> SharedChain;

    /// Current time adjusted by the median of peer clock differences.
    fn median_network_time(&self) -> Timestamp;
}
