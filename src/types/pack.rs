//! Coarse sync units
//!
//! Packs bundle order-assigned events of an epoch, epoch packs seal an
//! epoch, and block-vote batches carry decisions about it.

use serde::{Deserialize, Serialize};

use super::EventId;

/// Summary of an event pack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackInfo {
    pub epoch: u32,
    pub index: u64,
    /// Events of the pack not referenced by any other event of the pack
    pub heads: Vec<EventId>,
    /// Creation time in milliseconds
    pub timestamp: u64,
}

/// Seal of an epoch: its heads and how many events it holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochPack {
    pub epoch: u32,
    pub heads: Vec<EventId>,
    pub event_count: u32,
}

impl EpochPack {
    /// Approximate encoded size in bytes
    pub fn size(&self) -> u64 {
        (8 + self.heads.len() * super::EVENT_ID_LEN) as u64
    }
}

/// Batch of block votes for an epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVotes {
    pub epoch: u32,
    pub seq: u32,
    /// Whether this is the final batch of the epoch
    pub last: bool,
    pub votes: Vec<u8>,
}

impl BlockVotes {
    /// Stream key: `(epoch << 32) | seq`
    pub fn key(&self) -> u64 {
        block_votes_key(self.epoch, self.seq)
    }

    /// Approximate encoded size in bytes
    pub fn size(&self) -> u64 {
        (9 + self.votes.len()) as u64
    }
}

/// Stream key of a block-vote batch
pub fn block_votes_key(epoch: u32, seq: u32) -> u64 {
    ((epoch as u64) << 32) | seq as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_votes_key_orders_by_epoch_then_seq() {
        assert!(block_votes_key(1, u32::MAX) < block_votes_key(2, 0));
        assert!(block_votes_key(2, 0) < block_votes_key(2, 1));
        let bv = BlockVotes {
            epoch: 3,
            seq: 4,
            last: false,
            votes: vec![],
        };
        assert_eq!(bv.key() >> 32, 3);
        assert_eq!(bv.key() & 0xffff_ffff, 4);
    }
}
