//! Stream instantiations
//!
//! The generic session engine bound to the three keyspaces a node syncs:
//! DAG events of the open epoch, block-vote batches and epoch packs.

pub mod bvstream;
pub mod dagstream;
pub mod epstream;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::fetcher::EventsRequester;
use crate::transport::{spawn_send, Message, PeerTransport};
use crate::types::{EventId, PeerId, PeerProgress};

/// Last progress announced by each peer
#[derive(Clone, Default)]
pub struct ProgressTable {
    inner: Arc<RwLock<HashMap<PeerId, PeerProgress>>>,
}

impl ProgressTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer's announcement
    pub fn update(&self, peer: &PeerId, progress: PeerProgress) {
        self.inner.write().insert(peer.clone(), progress);
    }

    /// Forget a peer
    pub fn remove(&self, peer: &PeerId) {
        self.inner.write().remove(peer);
    }

    /// Last progress of a peer
    pub fn get(&self, peer: &PeerId) -> Option<PeerProgress> {
        self.inner.read().get(peer).copied()
    }
}

/// Requester asking `peer` for event bodies over `transport`
pub fn events_requester(transport: Arc<dyn PeerTransport>, peer: PeerId) -> EventsRequester {
    Arc::new(move |ids: &[EventId]| {
        spawn_send(
            transport.clone(),
            peer.clone(),
            Message::GetEvents { ids: ids.to_vec() },
        )
    })
}
