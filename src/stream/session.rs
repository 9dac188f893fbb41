//! Session, request and response shapes
//!
//! Typed forms are used inside the engine; wire forms carry locators as raw
//! bytes and are what peers exchange.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::stream::locator::Locator;

/// One bounded attempt to pull a contiguous range `[start, stop)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session<L> {
    pub id: u32,
    pub start: L,
    pub stop: L,
}

/// Per-chunk item count and byte size caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub num: u32,
    pub size: u64,
}

/// A chunk request for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<L> {
    pub session: Session<L>,
    pub limit: Limit,
    pub request_type: u8,
    pub max_chunks: u32,
}

/// A chunk of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response<P> {
    pub session_id: u32,
    pub done: bool,
    pub payload: P,
}

/// Session as sent over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSession {
    pub id: u32,
    pub start: Vec<u8>,
    pub stop: Vec<u8>,
}

/// Request as sent over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    pub session: WireSession,
    pub limit: Limit,
    pub request_type: u8,
    pub max_chunks: u32,
}

impl<L: Locator> Request<L> {
    /// Encode for the wire
    pub fn to_wire(&self) -> WireRequest {
        WireRequest {
            session: WireSession {
                id: self.session.id,
                start: self.session.start.to_bytes(),
                stop: self.session.stop.to_bytes(),
            },
            limit: self.limit,
            request_type: self.request_type,
            max_chunks: self.max_chunks,
        }
    }

    /// Decode and validate a request received from a peer
    ///
    /// Any failure is a `PeerMisbehaviour` error. The request type is
    /// validated by the stream that serves it.
    pub fn from_wire(wire: &WireRequest) -> Result<Self, SyncError> {
        let start = L::from_bytes(&wire.session.start)?;
        let stop = L::from_bytes(&wire.session.stop)?;
        if wire.limit.num == 0 || wire.limit.size == 0 {
            return Err(SyncError::misbehaviour("zero chunk limit"));
        }
        if wire.max_chunks == 0 {
            return Err(SyncError::misbehaviour("zero max chunks"));
        }
        Ok(Request {
            session: Session {
                id: wire.session.id,
                start,
                stop,
            },
            limit: wire.limit,
            request_type: wire.request_type,
            max_chunks: wire.max_chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::locator::IndexLocator;

    fn request() -> Request<IndexLocator> {
        Request {
            session: Session {
                id: 7,
                start: IndexLocator(3),
                stop: IndexLocator(10),
            },
            limit: Limit { num: 100, size: 1024 },
            request_type: 0,
            max_chunks: 4,
        }
    }

    #[test]
    fn test_wire_decode_keeps_fields() {
        let wire = request().to_wire();
        assert_eq!(wire.session.start.len(), 8);
        assert_eq!(Request::<IndexLocator>::from_wire(&wire).unwrap(), request());
    }

    #[test]
    fn test_bad_locator_length_is_misbehaviour() {
        let mut wire = request().to_wire();
        wire.session.stop.push(0);
        assert!(Request::<IndexLocator>::from_wire(&wire).unwrap_err().is_ban());
    }

    #[test]
    fn test_zero_limits_are_misbehaviour() {
        let mut wire = request().to_wire();
        wire.limit.num = 0;
        assert!(Request::<IndexLocator>::from_wire(&wire).unwrap_err().is_ban());

        let mut wire = request().to_wire();
        wire.max_chunks = 0;
        assert!(Request::<IndexLocator>::from_wire(&wire).unwrap_err().is_ban());
    }
}
