//! DAG event module
//!
//! Defines the gossip unit exchanged between peers and its
//! content-addressed identifier.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of an event identifier in bytes
pub const EVENT_ID_LEN: usize = 32;

/// Content-addressed identifier of a DAG event
///
/// Layout is `epoch (4, BE) | lamport (4, BE) | hash tail (24)`, so the
/// lexicographic order of the raw bytes groups events by epoch and then by
/// lamport time. Stream sessions rely on this order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId([u8; EVENT_ID_LEN]);

impl EventId {
    /// Build an id from its components
    pub fn new(epoch: u32, lamport: u32, tail: [u8; 24]) -> Self {
        let mut bytes = [0u8; EVENT_ID_LEN];
        bytes[0..4].copy_from_slice(&epoch.to_be_bytes());
        bytes[4..8].copy_from_slice(&lamport.to_be_bytes());
        bytes[8..].copy_from_slice(&tail);
        EventId(bytes)
    }

    /// Build an id from raw bytes
    pub fn from_bytes(bytes: [u8; EVENT_ID_LEN]) -> Self {
        EventId(bytes)
    }

    /// Build an id from a slice; `None` if the length is wrong
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; EVENT_ID_LEN] = bytes.try_into().ok()?;
        Some(EventId(arr))
    }

    /// Lowest possible id of an epoch
    pub fn epoch_start(epoch: u32) -> Self {
        EventId::new(epoch, 0, [0u8; 24])
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; EVENT_ID_LEN] {
        &self.0
    }

    /// Epoch encoded in the id
    pub fn epoch(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Lamport time encoded in the id
    pub fn lamport(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    /// Hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.epoch(), self.lamport(), hex::encode(&self.0[8..12]))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A DAG event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Content-addressed identifier
    pub id: EventId,
    /// Epoch the event belongs to
    pub epoch: u32,
    /// Lamport time
    pub lamport: u32,
    /// Parent event ids
    pub parents: Vec<EventId>,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl Event {
    /// Create a new event; the id is derived from the contents
    pub fn new(epoch: u32, lamport: u32, parents: Vec<EventId>, payload: Vec<u8>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(epoch.to_be_bytes());
        hasher.update(lamport.to_be_bytes());
        for parent in &parents {
            hasher.update(parent.as_bytes());
        }
        hasher.update(&payload);
        let digest = hasher.finalize();

        let mut tail = [0u8; 24];
        tail.copy_from_slice(&digest[..24]);

        Self {
            id: EventId::new(epoch, lamport, tail),
            epoch,
            lamport,
            parents,
            payload,
        }
    }

    /// Approximate encoded size in bytes
    pub fn size(&self) -> u64 {
        (EVENT_ID_LEN + 8 + self.parents.len() * EVENT_ID_LEN + self.payload.len()) as u64
    }

    /// Recompute the id from the contents and compare
    pub fn id_matches(&self) -> bool {
        Event::new(self.epoch, self.lamport, self.parents.clone(), self.payload.clone()).id == self.id
    }
}
