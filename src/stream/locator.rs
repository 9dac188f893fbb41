//! Stream locators
//!
//! A locator is a totally ordered key into a keyspace. On the wire it is a
//! raw byte string whose lexicographic order matches the ordering of the
//! decoded key.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt::Debug;

use crate::error::SyncError;
use crate::types::{EventId, EVENT_ID_LEN};

/// Ordered, incrementable key into a stream keyspace
pub trait Locator: Clone + Ord + Debug + Send + Sync + 'static {
    /// Encoded length in bytes
    const LEN: usize;

    /// Encode to raw bytes
    fn to_bytes(&self) -> Vec<u8>;

    /// Decode raw bytes received from a peer
    fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError>;

    /// Strict successor, or `None` at the end of the keyspace
    fn inc(&self) -> Option<Self>;
}

/// Numeric locator (epochs, pack indices, block-vote keys)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexLocator(pub u64);

impl Locator for IndexLocator {
    const LEN: usize = 8;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u64(self.0);
        buf.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        if bytes.len() != Self::LEN {
            return Err(SyncError::misbehaviour(format!(
                "invalid index locator length: expected {}, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut buf = bytes;
        Ok(IndexLocator(buf.get_u64()))
    }

    fn inc(&self) -> Option<Self> {
        self.0.checked_add(1).map(IndexLocator)
    }
}

/// Event-id locator used by the DAG stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdLocator(pub EventId);

impl Locator for IdLocator {
    const LEN: usize = EVENT_ID_LEN;

    fn to_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        EventId::from_slice(bytes).map(IdLocator).ok_or_else(|| {
            SyncError::misbehaviour(format!(
                "invalid event locator length: expected {}, got {}",
                Self::LEN,
                bytes.len()
            ))
        })
    }

    fn inc(&self) -> Option<Self> {
        // big-endian add with carry
        let mut bytes = *self.0.as_bytes();
        for b in bytes.iter_mut().rev() {
            if *b == 0xff {
                *b = 0;
            } else {
                *b += 1;
                return Some(IdLocator(EventId::from_bytes(bytes)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_locator_bytes_preserve_order() {
        let a = IndexLocator(255);
        let b = IndexLocator(256);
        assert!(a < b);
        assert!(a.to_bytes() < b.to_bytes());
        assert_eq!(IndexLocator::from_bytes(&b.to_bytes()).unwrap(), b);
    }

    #[test]
    fn test_index_locator_inc() {
        assert_eq!(IndexLocator(9).inc(), Some(IndexLocator(10)));
        assert_eq!(IndexLocator(u64::MAX).inc(), None);
    }

    #[test]
    fn test_index_locator_rejects_bad_length() {
        let err = IndexLocator::from_bytes(&[1, 2, 3]).unwrap_err();
        assert!(err.is_ban());
    }


    #[test]
    fn test_id_locator_inc_carries() {
        let mut raw = [0u8; 32];
        raw[31] = 0xff;
        raw[30] = 0x01;
        let loc = IdLocator(EventId::from_bytes(raw));
        let next = loc.inc().unwrap();
        assert!(next > loc);
        assert_eq!(next.0.as_bytes()[31], 0x00);
        assert_eq!(next.0.as_bytes()[30], 0x02);

        assert_eq!(IdLocator(EventId::from_bytes([0xff; 32])).inc(), None);
    }

    #[test]
    fn test_id_locator_inc_crosses_epoch_boundary() {
        let last_of_epoch = IdLocator(EventId::new(3, u32::MAX, [0xff; 24]));
        let next = last_of_epoch.inc().unwrap();
        assert_eq!(next.0, EventId::epoch_start(4));
    }

    #[test]
    fn test_id_locator_bytes_preserve_order() {
        let last_of_epoch = IdLocator(EventId::new(3, u32::MAX, [0xff; 24]));
        let next_epoch = IdLocator(EventId::epoch_start(4));
        assert!(last_of_epoch < next_epoch);
        assert!(last_of_epoch.to_bytes() < next_epoch.to_bytes());
        assert_eq!(IdLocator::from_bytes(&next_epoch.to_bytes()).unwrap(), next_epoch);
    }

    #[test]
    fn test_id_locator_rejects_bad_length() {
        assert!(IdLocator::from_bytes(&[0u8; 8]).unwrap_err().is_ban());
    }
}
