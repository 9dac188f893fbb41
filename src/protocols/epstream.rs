//! Epoch pack stream
//!
//! Pulls epoch packs keyed by epoch, from the lowest epoch without a pack
//! up to the peer's position.

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
use crate::types::{EpochPack, PeerId};

/// The only request type of the stream
pub const REQUEST_PACKS: u8 = 0;

/// Epoch pack stream chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpPayload {
    pub items: Vec<EpochPack>,
    size: u64,
}

impl Payload for EpPayload {
    type Locator = IndexLocator;
    type Item = EpochPack;

    fn add_item(&mut self, _locator: IndexLocator, ep: EpochPack) {
        self.size += ep.size();
        self.items.push(ep);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn total_size(&self) -> u64 {
        self.size
    }

    fn total_mem_size(&self) -> u64 {
        self.size + self.items.len() as u64 * 40
    }

    fn last_locator(&self) -> Option<IndexLocator> {
        self.items.last().map(|ep| IndexLocator(ep.epoch as u64))
    }
}

/// Serves epoch packs of the local store
pub struct EpSeederCallbacks {
    store: Arc<dyn Store>,
    transport: Arc<dyn PeerTransport>,
}

#[async_trait]
impl SeederCallbacks for EpSeederCallbacks {
    type Locator = IndexLocator;
    type Payload = EpPayload;

    fn name(&self) -> &'static str {
        "ep"
    }

    fn validate_request_type(&self, request_type: u8) -> bool {
        request_type == REQUEST_PACKS
    }

    fn new_payload(&self, _request_type: u8) -> EpPayload {
        EpPayload::default()
    }

    fn for_each_item(&self, start: &IndexLocator, _request_type: u8, f: &mut dyn FnMut(IndexLocator, EpochPack) -> bool) {
        let start = u32::try_from(start.0).unwrap_or(u32::MAX);
        self.store
            .for_each_epoch_pack(start, &mut |ep| f(IndexLocator(ep.epoch as u64), ep.clone()));
    }

    async fn send_chunk(&self, peer: &PeerId, response: Response<EpPayload>) -> anyhow::Result<()> {
        self.transport.send(peer, Message::EpStreamResponse(response)).await
    }
}

/// Pulls missing epoch packs
pub struct EpLeecherCallbacks {
    store: Arc<dyn Store>,
    transport: Arc<dyn PeerTransport>,
    progress: ProgressTable,
}

impl LeecherCallbacks for EpLeecherCallbacks {
    type Locator = IndexLocator;

    fn name(&self) -> &'static str {
        "ep"
    }

    fn local_progress(&self) -> u64 {
        self.store.epoch_packs_progress() as u64
    }

    fn peer_progress(&self, peer: &PeerId) -> Option<u64> {
        self.progress.get(peer).map(|p| p.ep_epoch as u64)
    }

    fn session_range(&self, local_progress: u64, peer_progress: u64) -> (IndexLocator, IndexLocator) {
        (IndexLocator(local_progress), IndexLocator(peer_progress.max(local_progress)))
    }

    fn is_processed(&self, locator: &IndexLocator) -> bool {
        u32::try_from(locator.0).map_or(false, |epoch| self.store.has_epoch_pack(epoch))
    }

    fn request_chunk(&self, peer: &PeerId, request: Request<IndexLocator>) -> anyhow::Result<()> {
        spawn_send(self.transport.clone(), peer.clone(), Message::EpStreamRequest(request.to_wire()))
    }

    fn session_done(&self, _window: u64) -> bool {
        false
    }
}

/// Epoch pack stream leecher and seeder of a node
pub struct EpStream {
    leecher: Arc<Leecher<EpLeecherCallbacks>>,
    seeder: Seeder<EpSeederCallbacks>,
    store: Arc<dyn Store>,
}

impl EpStream {
    /// Create a new epoch pack stream
    pub fn new(
        leecher_cfg: LeecherConfig,
        seeder_cfg: SeederConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn PeerTransport>,
        progress: ProgressTable,
    ) -> Self {
        let leecher = Leecher::new(
            leecher_cfg,
            Arc::new(EpLeecherCallbacks {
                store: store.clone(),
                transport: transport.clone(),
                progress,
            }),
        );
        let seeder = Seeder::new(
            seeder_cfg,
            Arc::new(EpSeederCallbacks {
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
    pub fn leecher(&self) -> &Arc<Leecher<EpLeecherCallbacks>> {
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
    pub fn on_response(&self, peer: &PeerId, response: Response<EpPayload>) -> Result<(), SyncError> {
        if !self.leecher.is_active_session(response.session_id) {
            trace!("ep stream: dropping chunk of stale session {} from {}", response.session_id, peer);
            return Ok(());
        }
        let epochs_ordered = response.payload.items.windows(2).all(|w| w[0].epoch < w[1].epoch);
        if !epochs_ordered {
            return Err(SyncError::misbehaviour_with_peer("unordered epoch packs", peer.as_str()));
        }

        let last = response.payload.last_locator();
        for ep in response.payload.items {
            self.store.insert_epoch_pack(ep);
        }
        self.leecher.notify_chunk_received(response.session_id, last, response.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EpochPackStore, MemoryStore};
    use crate::transport::MemoryNetwork;
    use crate::types::EventId;

    #[test]
    fn test_payload_tracks_last_epoch() {
        let mut payload = EpPayload::default();
        let ep = EpochPack {
            epoch: 4,
            heads: vec![EventId::epoch_start(4)],
            event_count: 10,
        };
        payload.add_item(IndexLocator(4), ep.clone());
        assert_eq!(payload.last_locator(), Some(IndexLocator(4)));
        assert_eq!(payload.total_size(), ep.size());
    }

    #[tokio::test]
    async fn test_stale_response_is_not_applied() {
        let net = MemoryNetwork::new(0.0, 1);
        let (transport, _inbox) = net.join(PeerId::new("me"));
        let store = Arc::new(MemoryStore::new());
        let stream = EpStream::new(
            LeecherConfig::default(),
            SeederConfig::default(),
            store.clone(),
            transport,
            ProgressTable::new(),
        );
        let mut payload = EpPayload::default();
        payload.add_item(
            IndexLocator(1),
            EpochPack {
                epoch: 1,
                heads: vec![],
                event_count: 0,
            },
        );
        stream
            .on_response(
                &PeerId::new("peer"),
                Response {
                    session_id: 77,
                    done: true,
                    payload,
                },
            )
            .unwrap();
        assert!(!store.has_epoch_pack(1));
    }
}
