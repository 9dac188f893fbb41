//! Block-vote stream
//!
//! Pulls block-vote batches keyed by `(epoch << 32) | seq`, from the
//! lowest epoch without decided votes up to the peer's position.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

use super::ProgressTable;
use crate::error::SyncError;
use crate::store::Store;
use crate::stream::{
    IndexLocator, Leecher, LeecherCallbacks, LeecherConfig, Payload, Request, Response, Seeder, SeederCallbacks,
    SeederConfig, WireRequest,
};
use crate::transport::{spawn_send, Message, PeerTransport};
use crate::types::{block_votes_key, BlockVotes, PeerId};

/// The only request type of the stream
pub const REQUEST_VOTES: u8 = 0;

/// Block-vote stream chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BvPayload {
    pub items: Vec<BlockVotes>,
    size: u64,
}

impl Payload for BvPayload {
    type Locator = IndexLocator;
    type Item = BlockVotes;

    fn add_item(&mut self, _locator: IndexLocator, bv: BlockVotes) {
        self.size += bv.size();
        self.items.push(bv);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn total_size(&self) -> u64 {
        self.size
    }

    fn total_mem_size(&self) -> u64 {
        self.size + self.items.len() as u64 * 48
    }

    fn last_locator(&self) -> Option<IndexLocator> {
        self.items.last().map(|bv| IndexLocator(bv.key()))
    }
}

/// Serves block votes of the local store
pub struct BvSeederCallbacks {
    store: Arc<dyn Store>,
    transport: Arc<dyn PeerTransport>,
}

#[async_trait]
impl SeederCallbacks for BvSeederCallbacks {
    type Locator = IndexLocator;
    type Payload = BvPayload;

    fn name(&self) -> &'static str {
        "bv"
    }

    fn validate_request_type(&self, request_type: u8) -> bool {
        request_type == REQUEST_VOTES
    }

    fn new_payload(&self, _request_type: u8) -> BvPayload {
        BvPayload::default()
    }

    fn for_each_item(&self, start: &IndexLocator, _request_type: u8, f: &mut dyn FnMut(IndexLocator, BlockVotes) -> bool) {
        self.store
            .for_each_block_votes(start.0, &mut |bv| f(IndexLocator(bv.key()), bv.clone()));
    }

    async fn send_chunk(&self, peer: &PeerId, response: Response<BvPayload>) -> anyhow::Result<()> {
        self.transport.send(peer, Message::BvStreamResponse(response)).await
    }
}

/// Pulls undecided epochs
pub struct BvLeecherCallbacks {
    store: Arc<dyn Store>,
    transport: Arc<dyn PeerTransport>,
    progress: ProgressTable,
}

impl LeecherCallbacks for BvLeecherCallbacks {
    type Locator = IndexLocator;

    fn name(&self) -> &'static str {
        "bv"
    }

    fn local_progress(&self) -> u64 {
        self.store.block_votes_progress() as u64
    }

    fn peer_progress(&self, peer: &PeerId) -> Option<u64> {
        self.progress.get(peer).map(|p| p.bv_epoch as u64)
    }

    fn session_range(&self, local_progress: u64, peer_progress: u64) -> (IndexLocator, IndexLocator) {
        let start = u32::try_from(local_progress).unwrap_or(u32::MAX);
        let stop = u32::try_from(peer_progress).unwrap_or(u32::MAX).max(start);
        (
            IndexLocator(block_votes_key(start, 0)),
            IndexLocator(block_votes_key(stop, 0)),
        )
    }

    fn is_processed(&self, locator: &IndexLocator) -> bool {
        self.store.has_block_votes(locator.0)
    }

    fn request_chunk(&self, peer: &PeerId, request: Request<IndexLocator>) -> anyhow::Result<()> {
        spawn_send(self.transport.clone(), peer.clone(), Message::BvStreamRequest(request.to_wire()))
    }

    fn session_done(&self, _window: u64) -> bool {
        false
    }
}

/// Block-vote stream leecher and seeder of a node
pub struct BvStream {
    leecher: Arc<Leecher<BvLeecherCallbacks>>,
    seeder: Seeder<BvSeederCallbacks>,
    store: Arc<dyn Store>,
}

impl BvStream {
    /// Create a new block-vote stream
    pub fn new(
        leecher_cfg: LeecherConfig,
        seeder_cfg: SeederConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn PeerTransport>,
        progress: ProgressTable,
    ) -> Self {
        let leecher = Leecher::new(
            leecher_cfg,
            Arc::new(BvLeecherCallbacks {
                store: store.clone(),
                transport: transport.clone(),
                progress,
            }),
        );
        let seeder = Seeder::new(
            seeder_cfg,
            Arc::new(BvSeederCallbacks {
                store: store.clone(),
                transport,
            }),
        );
        Self {
            leecher: Arc::new(leecher),
            seeder,
            store,
        }
    }

    /// The leecher
    pub fn leecher(&self) -> &Arc<Leecher<BvLeecherCallbacks>> {
        &self.leecher
    }

    pub fn start(&self) {
        self.seeder.start();
        self.leecher.start();
    }

    pub async fn stop(&self) {
        self.leecher.stop().await;
        self.seeder.stop().await;
    }

    pub fn register_peer(&self, peer: &PeerId) {
        self.leecher.register_peer(peer.clone());
    }

    pub fn unregister_peer(&self, peer: &PeerId) {
        self.leecher.unregister_peer(peer, Instant::now());
        self.seeder.notify_peer_dropped(peer);
    }

    pub fn on_request(&self, peer: &PeerId, request: &WireRequest) -> Result<(), SyncError> {
        self.seeder.notify_request_received(peer, request)
    }

    /// Apply a chunk of the active session
    ///
    /// Batches must be in strictly increasing key order.
    pub fn on_response(&self, peer: &PeerId, response: Response<BvPayload>) -> Result<(), SyncError> {
        if !self.leecher.is_active_session(response.session_id) {
            trace!("bv stream: dropping chunk of stale session {} from {}", response.session_id, peer);
            return Ok(());
        }
        let keys_ordered = response.payload.items.windows(2).all(|w| w[0].key() < w[1].key());
        if !keys_ordered {
            return Err(SyncError::misbehaviour_with_peer("unordered block votes", peer.as_str()));
        }

        let last = response.payload.last_locator();
        for bv in response.payload.items {
            self.store.insert_block_votes(bv);
        }
        self.leecher.notify_chunk_received(response.session_id, last, response.done)
    }
}
