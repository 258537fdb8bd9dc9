//! Wire protocol for cinder node-to-node gossip.
//!
//! Every frame on a peer channel is the textual serialization of an
//! ordered pair `[counter, object]`, where `object` is a self-describing
//! map whose action field selects the [`Gossip`] variant. The codec
//! parses and renders frames; payload content stays opaque and is handed
//! to the ledger untouched.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::Codec;
pub use error::GossipError;
pub use message::{Gossip, Index, Payload};
