//! Frame codec — parse and render `[counter, object]` gossip frames.
//!
//! The action field name is a runtime parameter, so frames are assembled
//! and picked apart by hand on top of `serde_json::Value` rather than
//! through a derived tagged enum.

use crate::{Gossip, GossipError, Index, Payload};
use cinder_types::{BlockHash, Timestamp};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Frame codec parameterized by the action-key name and the extra-block
/// limit enforced on `result` replies.
#[derive(Clone, Debug)]
pub struct Codec {
    action_key: String,
    max_extra_blocks: usize,
}

impl Codec {
    pub fn new(action_key: impl Into<String>, max_extra_blocks: usize) -> Self {
        Self {
            action_key: action_key.into(),
            max_extra_blocks,
        }
    }

    pub fn action_key(&self) -> &str {
        &self.action_key
    }

    pub fn max_extra_blocks(&self) -> usize {
        self.max_extra_blocks
    }

    /// Render a frame as JSON text.
    pub fn encode(&self, counter: u64, gossip: &Gossip) -> String {
        let mut obj = Map::new();
        obj.insert(self.action_key.clone(), json!(gossip.action()));

        match gossip {
            Gossip::Query | Gossip::Passive | Gossip::Forget => {}
            Gossip::Index(index) => {
                obj.insert(
                    "index".into(),
                    json!({
                        "genesis": index.genesis.as_str(),
                        "highest": index.highest.as_str(),
                        "height": index.height,
                        "time": index.timestamp.as_secs(),
                        "peers": index.peers,
                    }),
                );
            }
            Gossip::Block(block) => {
                obj.insert("block".into(), Value::Object(block.clone()));
            }
            Gossip::Transaction(tx) => {
                obj.insert("tx".into(), Value::Object(tx.clone()));
            }
            Gossip::Fetch { hash, extra } => {
                obj.insert("hash".into(), json!(hash.as_str()));
                obj.insert("extra".into(), json!(extra));
            }
            Gossip::Result { block, extra } => {
                obj.insert("block".into(), Value::Object(block.clone()));
                let extra_obj: Map<String, Value> = extra
                    .iter()
                    .map(|(hash, payload)| (hash.as_str().to_string(), Value::Object(payload.clone())))
                    .collect();
                obj.insert("extra".into(), Value::Object(extra_obj));
            }
            Gossip::Error(message) => {
                obj.insert("message".into(), json!(message));
            }
        }

        Value::Array(vec![json!(counter), Value::Object(obj)]).to_string()
    }

    /// Parse a frame from JSON text.
    pub fn decode(&self, text: &str) -> Result<(u64, Gossip), GossipError> {
        let frame: Value =
            serde_json::from_str(text).map_err(|e| GossipError::Deserialization(e.to_string()))?;

        let pair = frame.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
            GossipError::Deserialization("frame is not a [counter, object] pair".into())
        })?;

        let counter = lenient_u64(&pair[0]).ok_or_else(|| {
            GossipError::Deserialization("frame counter is not a non-negative number".into())
        })?;

        let obj = pair[1].as_object().ok_or_else(|| {
            GossipError::Deserialization("frame body is not an object".into())
        })?;

        let action = match obj.get(&self.action_key) {
            None => return Err(GossipError::MissingActionKey(self.action_key.clone())),
            Some(v) => v.as_str().ok_or_else(|| {
                GossipError::Deserialization(format!(
                    "action field `{}` is not a string",
                    self.action_key
                ))
            })?,
        };

        let gossip = match action {
            "query" => Gossip::Query,
            "passive" => Gossip::Passive,
            "forget" => Gossip::Forget,
            "index" => Gossip::Index(decode_index(map_field(obj, "index")?)?),
            "block" => Gossip::Block(map_field(obj, "block")?.clone()),
            "tx" => Gossip::Transaction(map_field(obj, "tx")?.clone()),
            "fetch" => {
                let hash = BlockHash::new(str_field(obj, "hash")?);
                // `extra` defaults to 0 when absent.
                let extra = match obj.get("extra") {
                    None => 0,
                    Some(v) => u32::try_from(lenient_u64(v).ok_or_else(|| mistyped("extra"))?)
                        .map_err(|_| mistyped("extra"))?,
                };
                Gossip::Fetch { hash, extra }
            }
            "result" => {
                let block = map_field(obj, "block")?.clone();
                let extra = match obj.get("extra") {
                    None => BTreeMap::new(),
                    Some(v) => {
                        let entries = v.as_object().ok_or_else(|| mistyped("extra"))?;
                        if entries.len() > self.max_extra_blocks {
                            return Err(GossipError::LimitExceeded {
                                count: entries.len(),
                                limit: self.max_extra_blocks,
                            });
                        }
                        let mut extra = BTreeMap::new();
                        for (hash, payload) in entries {
                            let payload = payload.as_object().ok_or_else(|| mistyped("extra"))?;
                            extra.insert(BlockHash::new(hash.as_str()), payload.clone());
                        }
                        extra
                    }
                };
                Gossip::Result { block, extra }
            }
            "error" => Gossip::Error(str_field(obj, "message")?.to_string()),
            other => return Err(GossipError::UnknownAction(other.to_string())),
        };

        Ok((counter, gossip))
    }
}

fn decode_index(obj: &Payload) -> Result<Index, GossipError> {
    let peers_value = obj.get("peers").ok_or_else(|| mistyped("peers"))?;
    let peers = peers_value
        .as_array()
        .ok_or_else(|| mistyped("peers"))?
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(|| mistyped("peers")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Index {
        genesis: BlockHash::new(str_field(obj, "genesis")?),
        highest: BlockHash::new(str_field(obj, "highest")?),
        height: u64_field(obj, "height")?,
        timestamp: Timestamp::new(u64_field(obj, "time")?),
        peers,
    })
}

/// Read a number leniently: wire peers encode integers either as fixed
/// integers or as arbitrary-precision values that arrive as floats.
fn lenient_u64(v: &Value) -> Option<u64> {
    if let Some(n) = v.as_u64() {
        return Some(n);
    }
    match v.as_f64() {
        Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Some(f as u64),
        _ => None,
    }
}

fn mistyped(key: &str) -> GossipError {
    GossipError::Deserialization(format!("missing or mistyped field `{key}`"))
}

fn str_field<'a>(obj: &'a Payload, key: &str) -> Result<&'a str, GossipError> {
    obj.get(key).and_then(Value::as_str).ok_or_else(|| mistyped(key))
}

fn map_field<'a>(obj: &'a Payload, key: &str) -> Result<&'a Payload, GossipError> {
    obj.get(key).and_then(Value::as_object).ok_or_else(|| mistyped(key))
}

fn u64_field(obj: &Payload, key: &str) -> Result<u64, GossipError> {
    obj.get(key).and_then(lenient_u64).ok_or_else(|| mistyped(key))
}
