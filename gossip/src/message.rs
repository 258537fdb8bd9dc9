//! Gossip message types.

use cinder_types::{BlockHash, Timestamp};
use std::collections::BTreeMap;

/// Opaque block/transaction content. The gossip layer passes these maps
/// through to the ledger without interpreting them.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// One frame of the peer protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Gossip {
    /// Ask the peer for its chain index.
    Query,
    /// Reply to `Query` with the peer's chain snapshot.
    Index(Index),
    /// Reply to `Query` when the peer exposes no index.
    Passive,
    /// Unsolicited block.
    Block(Payload),
    /// Unsolicited transaction.
    Transaction(Payload),
    /// Request a block by hash plus up to `extra` ancestors.
    Fetch { hash: BlockHash, extra: u32 },
    /// Reply to `Fetch`: the block and its ancestors keyed by hash.
    Result {
        block: Payload,
        extra: BTreeMap<BlockHash, Payload>,
    },
    /// Reply carrying failure text.
    Error(String),
    /// The peer asks to be forgotten.
    Forget,
}

impl Gossip {
    /// Wire action string for this variant.
    pub fn action(&self) -> &'static str {
        match self {
            Gossip::Query => "query",
            Gossip::Index(_) => "index",
            Gossip::Passive => "passive",
            Gossip::Block(_) => "block",
            Gossip::Transaction(_) => "tx",
            Gossip::Fetch { .. } => "fetch",
            Gossip::Result { .. } => "result",
            Gossip::Error(_) => "error",
            Gossip::Forget => "forget",
        }
    }

    /// Whether this variant is only ever valid as a reply. Receiving one
    /// of these as an unsolicited request is a protocol violation.
    pub fn is_reply_kind(&self) -> bool {
        matches!(
            self,
            Gossip::Index(_) | Gossip::Passive | Gossip::Result { .. } | Gossip::Error(_)
        )
    }
}

/// A peer's snapshot of its chain: genesis, head, and known peers.
///
/// Two indexes are equal iff every field is equal. Peer URLs stay raw
/// strings here; they are validated when peers are created from them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Index {
    pub genesis: BlockHash,
    pub highest: BlockHash,
    pub height: u64,
    pub timestamp: Timestamp,
    pub peers: Vec<String>,
}
