//! Peer identity
//!
//! Peers are addressed by an opaque name assigned by the transport.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer id
    pub fn new(name: impl Into<String>) -> Self {
        PeerId(name.into())
    }

    /// Get the peer name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        PeerId::new(name)
    }
}

impl From<String> for PeerId {
    fn from(name: String) -> Self {
        PeerId(name)
    }
}

/// Sync position a peer announces about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProgress {
    /// Current (open) epoch
    pub epoch: u32,
    /// Lowest epoch without decided block votes
    pub bv_epoch: u32,
    /// Lowest epoch without an epoch pack
    pub ep_epoch: u32,
    /// Number of packs in the current epoch
    pub packs_num: u64,
}
