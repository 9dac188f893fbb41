//! Store-backed hooks for the fetcher and the pack downloader

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::eventcheck::{BasicCheck, CheckError, LightCheck};
use crate::fetcher::{EventsRequester, FetcherCallback};
use crate::packs::PacksCallback;
use crate::protocols::events_requester;
use crate::store::Store;
use crate::transport::{spawn_send, Message, PeerTransport};
use crate::types::{Event, EventId, PackInfo, PeerId};

/// Fetcher hooks over a store; dropped peers are reported on a channel
pub struct StoreFetcherCallback {
    store: Arc<dyn Store>,
    light: BasicCheck,
    drops: mpsc::UnboundedSender<PeerId>,
}

impl StoreFetcherCallback {
    pub fn new(store: Arc<dyn Store>, drops: mpsc::UnboundedSender<PeerId>) -> Self {
        Self {
            store,
            light: BasicCheck::default(),
            drops,
        }
    }
}

impl FetcherCallback for StoreFetcherCallback {
    fn only_interested(&self, ids: &[EventId]) -> Vec<EventId> {
        self.store.only_interested(ids)
    }

    fn push_event(&self, peer: &PeerId, event: Event) {
        let id = event.id;
        match self.store.insert_event(event) {
            Ok(()) => trace!("Connected event {} from {}", id, peer),
            Err(e) => trace!("Event {} from {} not connected: {}", id, peer, e),
        }
    }

    fn check_light(&self, event: &Event) -> Result<(), CheckError> {
        self.light.check(event)?;
        let expected = self.store.epoch();
        if event.epoch != expected {
            return Err(CheckError::WrongEpoch {
                epoch: event.epoch,
                expected,
            });
        }
        if self.store.has_event(&event.id) {
            return Err(CheckError::AlreadyConnected);
        }
        Ok(())
    }

    fn drop_peer(&self, peer: &PeerId) {
        if self.drops.send(peer.clone()).is_err() {
            warn!("Cannot drop peer {}: handler is gone", peer);
        }
    }
}

/// Pack downloader hooks over a store and a transport
pub struct StorePacksCallback {
    store: Arc<dyn Store>,
    transport: Arc<dyn PeerTransport>,
}

impl StorePacksCallback {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn PeerTransport>) -> Self {
        Self { store, transport }
    }
}

impl PacksCallback for StorePacksCallback {
    fn local_epoch(&self) -> u32 {
        self.store.epoch()
    }

    fn is_connected(&self, info: &PackInfo) -> bool {
        info.heads.iter().all(|head| self.store.has_event(head))
    }

    fn request_pack_infos(&self, peer: &PeerId, epoch: u32, indexes: Vec<u64>) -> anyhow::Result<()> {
        spawn_send(self.transport.clone(), peer.clone(), Message::GetPackInfos { epoch, indexes })
    }

    fn request_pack(&self, peer: &PeerId, epoch: u32, index: u64) -> anyhow::Result<()> {
        spawn_send(self.transport.clone(), peer.clone(), Message::GetPack { epoch, index })
    }

    fn events_requester(&self, peer: &PeerId) -> EventsRequester {
        events_requester(self.transport.clone(), peer.clone())
    }
}
