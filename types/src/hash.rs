//! Block hash identifier.
//!
//! The ledger owns hashing; at the gossip layer a hash is an opaque
//! canonical string. The newtype keeps hash-typed and free-text values
//! from mixing, and is ordered so it can key sorted maps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The canonical string form of a ledger block hash.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHash(String);

impl BlockHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlockHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}
