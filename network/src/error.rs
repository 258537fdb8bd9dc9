use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection is not open")]
    NotConnected,

    #[error("handshake did not offer a protocol version")]
    ProtocolVersionMissing,

    #[error("unsupported protocol version `{offered}`, expected `{expected}`")]
    ProtocolVersionUnsupported { offered: String, expected: String },

    #[error("outgoing connections require a listening port")]
    OutboundUnavailable,

    #[error("invalid peer URL: {0}")]
    InvalidPeerUrl(#[from] cinder_types::PeerUrlError),

    #[error("gossip error: {0}")]
    Gossip(#[from] cinder_gossip::GossipError),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

/// Rejections returned by the [`crate::Node`] collaborator when it is
/// handed gossip payloads. The core maps these onto per-peer failure
/// states; they never propagate across peers.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("rejected: {0}")]
    Rejected(String),
}
