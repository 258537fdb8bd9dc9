//! Network configuration with TOML file support.

use crate::NetworkError;
use cinder_gossip::Codec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration surface of the gossip core.
///
/// Can be loaded from a TOML file via [`NetworkConfig::from_toml_file`]
/// or built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Name of the variant-tag field in gossip objects.
    #[serde(default = "default_action_key")]
    pub action_key: String,

    /// Protocol tag required at channel establishment (the WebSocket
    /// subprotocol). Mismatching peers are rejected during the upgrade.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Query-parameter name carrying the local node id on outgoing
    /// connection URLs.
    #[serde(default = "default_uuid_request_key")]
    pub uuid_request_key: String,

    /// Query-parameter name carrying the local listen port on outgoing
    /// connection URLs.
    #[serde(default = "default_port_request_key")]
    pub port_request_key: String,

    /// Upper bound on `fetch.extra` and on the size of `result.extra`.
    #[serde(default = "default_max_extra_blocks")]
    pub max_extra_blocks: usize,

    /// Minimum interval between successive inbound request handler
    /// invocations for one peer, in milliseconds.
    #[serde(default = "default_request_throttle_ms")]
    pub request_throttle_ms: u64,

    /// Bound on the per-peer inbound request queue.
    #[serde(default = "default_request_queue_limit")]
    pub request_queue_limit: usize,

    /// Deadline for connecting/querying states and cooldown before a
    /// failed peer is retried, in seconds.
    #[serde(default = "default_retry_cooldown_secs")]
    pub retry_cooldown_secs: u64,

    /// Whether this node may initiate outgoing channels. With this off
    /// the node runs purely passively and peers that would need dialing
    /// are shunned.
    #[serde(default = "default_true")]
    pub outbound_enabled: bool,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_action_key() -> String {
    "t".to_string()
}

fn default_protocol_version() -> String {
    "cinder-v1".to_string()
}

fn default_uuid_request_key() -> String {
    "uuid".to_string()
}

fn default_port_request_key() -> String {
    "port".to_string()
}

fn default_max_extra_blocks() -> usize {
    32
}

fn default_request_throttle_ms() -> u64 {
    500
}

fn default_request_queue_limit() -> usize {
    100
}

fn default_retry_cooldown_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NetworkConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, NetworkError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NetworkError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NetworkError> {
        toml::from_str(s).map_err(|e| NetworkError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, NetworkError> {
        toml::to_string_pretty(self).map_err(|e| NetworkError::Config(e.to_string()))
    }

    /// The frame codec this configuration describes.
    pub fn codec(&self) -> Codec {
        Codec::new(self.action_key.clone(), self.max_extra_blocks)
    }

    /// Minimum interval between inbound handler invocations per peer.
    pub fn request_throttle(&self) -> Duration {
        Duration::from_millis(self.request_throttle_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            action_key: default_action_key(),
            protocol_version: default_protocol_version(),
            uuid_request_key: default_uuid_request_key(),
            port_request_key: default_port_request_key(),
            max_extra_blocks: default_max_extra_blocks(),
            request_throttle_ms: default_request_throttle_ms(),
            request_queue_limit: default_request_queue_limit(),
            retry_cooldown_secs: default_retry_cooldown_secs(),
            outbound_enabled: default_true(),
        }
    }
}
