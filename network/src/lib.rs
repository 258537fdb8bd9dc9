//! P2P networking core for a cinder node.
//!
//! Maintains peer relationships over bidirectional WebSocket channels:
//! request/reply correlation on each connection, a per-peer lifecycle
//! state machine with timeouts and retry backoff, throttled inbound
//! request handling, and a server accepting incoming channels. The
//! ledger and the node itself are collaborators reached through the
//! [`ChainView`] and [`Node`] traits.

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod node;
pub mod peer;
pub mod server;
pub mod throttle;
pub mod transport;

pub use config::NetworkConfig;
pub use connection::{Direction, PeerConnection, ReplyCallback};
pub use error::{NetworkError, NodeError};
pub use node::{Candidate, ChainBlock, ChainHead, ChainView, Node, SharedChain};
pub use peer::{InboundRequest, Peer, PeerState};
pub use server::GossipServer;
pub use throttle::ThrottlingQueue;
pub use transport::IncomingHandshake;
