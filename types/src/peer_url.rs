//! Validated peer URLs.
//!
//! A peer is addressed as `scheme://<uuid>@<host>:<port>/` — the user
//! component is the peer's node id. A URL without a port is accepted at
//! construction (port reads as 0, meaning the peer cannot accept
//! incoming connections); dialing such a peer is refused upstream.

use crate::NodeId;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum PeerUrlError {
    #[error("invalid URL: {0}")]
    Invalid(#[from] url::ParseError),

    #[error("peer URL has no host")]
    MissingHost,

    #[error("peer URL user component is not a node UUID")]
    MissingNodeId,
}

/// A peer address carrying the peer's node id in its user component.
#[derive(Clone)]
pub struct PeerUrl {
    url: Url,
    node_id: NodeId,
}

impl PeerUrl {
    /// Parse and validate a peer URL.
    pub fn parse(s: &str) -> Result<Self, PeerUrlError> {
        let url = Url::parse(s)?;
        if url.host_str().is_none() {
            return Err(PeerUrlError::MissingHost);
        }
        let node_id = url
            .username()
            .parse::<NodeId>()
            .map_err(|_| PeerUrlError::MissingNodeId)?;
        Ok(Self { url, node_id })
    }

    /// Build a peer URL from its parts.
    pub fn from_parts(
        scheme: &str,
        node_id: NodeId,
        host: &str,
        port: u16,
    ) -> Result<Self, PeerUrlError> {
        Self::parse(&format!("{scheme}://{node_id}@{host}:{port}/"))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Declared port, or 0 when the URL carries none.
    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(0)
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl PartialEq for PeerUrl {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for PeerUrl {}

impl fmt::Debug for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerUrl({})", self.url)
    }
}

impl fmt::Display for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl FromStr for PeerUrl {
    type Err = PeerUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PeerUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.url.as_str())
    }
}

impl<'de> Deserialize<'de> for PeerUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}
