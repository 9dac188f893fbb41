//! In-process network
//!
//! Every node owns a bounded inbox. Messages can be dropped at random to
//! exercise the retry paths.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Message, PeerTransport};
use crate::error::SyncError;
use crate::types::PeerId;

/// Capacity of a node inbox
pub const INBOX_CAPACITY: usize = 4096;

/// Inbound messages of a node, tagged with the sender
pub type Inbox = mpsc::Receiver<(PeerId, Message)>;

/// In-process message bus
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<PeerId, mpsc::Sender<(PeerId, Message)>>>,
    loss: f64,
    rng: Mutex<StdRng>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryNetwork {
    /// Create a network dropping each message with probability `loss`
    pub fn new(loss: f64, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            loss: loss.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Attach a node
    pub fn join(self: &Arc<Self>, id: PeerId) -> (Arc<MemoryTransport>, Inbox) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.nodes.write().insert(id.clone(), tx);
        debug!("Node {} joined the network", id);
        (
            Arc::new(MemoryTransport {
                id,
                network: self.clone(),
            }),
            rx,
        )
    }

    /// Detach a node; its inbox closes
    pub fn leave(&self, id: &PeerId) {
        if self.nodes.write().remove(id).is_some() {
            debug!("Node {} left the network", id);
        }
    }

    /// Messages delivered and dropped so far
    pub fn stats(&self) -> (u64, u64) {
        (self.delivered.load(Ordering::Relaxed), self.dropped.load(Ordering::Relaxed))
    }

    fn lose(&self) -> bool {
        self.loss > 0.0 && self.rng.lock().gen_bool(self.loss)
    }
}

/// A node's handle on a [`MemoryNetwork`]
pub struct MemoryTransport {
    id: PeerId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    async fn send(&self, to: &PeerId, msg: Message) -> anyhow::Result<()> {
        let inbox = self
            .network
            .nodes
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| SyncError::transport_error(format!("unknown peer {}", to)))?;

        if self.network.lose() {
            trace!("Dropping {} from {} to {}", msg.name(), self.id, to);
            self.network.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        inbox
            .send((self.id.clone(), msg))
            .await
            .map_err(|_| SyncError::transport_error_full("inbox closed", to.as_str(), self.id.as_str()))?;
        self.network.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_with_sender() {
        let net = MemoryNetwork::new(0.0, 1);
        let (a, _a_inbox) = net.join(PeerId::new("a"));
        let (_b, mut b_inbox) = net.join(PeerId::new("b"));

        a.send(&PeerId::new("b"), Message::GetPack { epoch: 1, index: 2 }).await.unwrap();
        let (from, msg) = b_inbox.recv().await.unwrap();
        assert_eq!(from, PeerId::new("a"));
        assert!(matches!(msg, Message::GetPack { epoch: 1, index: 2 }));
        assert_eq!(net.stats(), (1, 0));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_an_error() {
        let net = MemoryNetwork::new(0.0, 1);
        let (a, _inbox) = net.join(PeerId::new("a"));
        assert!(a.send(&PeerId::new("nobody"), Message::GetEvents { ids: vec![] }).await.is_err());

        net.leave(&PeerId::new("a"));
        assert!(a.send(&PeerId::new("a"), Message::GetEvents { ids: vec![] }).await.is_err());
    }

    #[tokio::test]
    async fn test_full_loss_drops_everything() {
        let net = MemoryNetwork::new(1.0, 1);
        let (a, _a_inbox) = net.join(PeerId::new("a"));
        let (_b, mut b_inbox) = net.join(PeerId::new("b"));
        for _ in 0..10 {
            a.send(&PeerId::new("b"), Message::GetEvents { ids: vec![] }).await.unwrap();
        }
        assert!(b_inbox.try_recv().is_err());
        assert_eq!(net.stats(), (0, 10));
    }
}
