//! DAG event stream
//!
//! Pulls every event of the open epoch in id order. Chunks carry either
//! full events, which go through the fetcher's checks, or bare ids, which
//! are announced to the fetcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

use super::{events_requester, ProgressTable};
use crate::error::SyncError;
use crate::fetcher::Fetcher;
use crate::store::Store;
use crate::stream::{
    IdLocator, Leecher, LeecherCallbacks, LeecherConfig, Payload, Request, Response, Seeder, SeederCallbacks,
    SeederConfig, WireRequest,
};
use crate::transport::{spawn_send, Message, PeerTransport};
use crate::types::{Event, EventId, PeerId, EVENT_ID_LEN};

/// Every n-th try asks for ids only
const IDS_ONLY_EVERY: u32 = 5;

/// What a DAG stream chunk carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Ids = 0,
    Events = 1,
}

impl TryFrom<u8> for RequestType {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RequestType::Ids),
            1 => Ok(RequestType::Events),
            other => Err(SyncError::misbehaviour(format!("unknown dag request type {}", other))),
        }
    }
}

/// DAG stream chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagPayload {
    pub only_ids: bool,
    pub ids: Vec<EventId>,
    pub events: Vec<Event>,
    size: u64,
}

impl DagPayload {
    /// Create an empty payload for a request type
    pub fn new(request_type: RequestType) -> Self {
        Self {
            only_ids: request_type == RequestType::Ids,
            ..Self::default()
        }
    }
}

impl Payload for DagPayload {
    type Locator = IdLocator;
    type Item = Event;

    fn add_item(&mut self, locator: IdLocator, event: Event) {
        self.ids.push(locator.0);
        if self.only_ids {
            self.size += EVENT_ID_LEN as u64;
        } else {
            self.size += event.size();
            self.events.push(event);
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn total_size(&self) -> u64 {
        self.size
    }

    fn total_mem_size(&self) -> u64 {
        self.size + (self.ids.len() * EVENT_ID_LEN) as u64 + 64
    }

    fn last_locator(&self) -> Option<IdLocator> {
        self.ids.last().copied().map(IdLocator)
    }
}

/// Serves events of the local store
pub struct DagSeederCallbacks {
    store: Arc<dyn Store>,
    transport: Arc<dyn PeerTransport>,
}

#[async_trait]
impl SeederCallbacks for DagSeederCallbacks {
    type Locator = IdLocator;
    type Payload = DagPayload;

    fn name(&self) -> &'static str {
        "dag"
    }

    fn validate_request_type(&self, request_type: u8) -> bool {
        RequestType::try_from(request_type).is_ok()
    }

    fn new_payload(&self, request_type: u8) -> DagPayload {
        DagPayload::new(RequestType::try_from(request_type).unwrap_or(RequestType::Events))
    }

    fn for_each_item(&self, start: &IdLocator, _request_type: u8, f: &mut dyn FnMut(IdLocator, Event) -> bool) {
        self.store.for_each_event(&start.0, &mut |event| f(IdLocator(event.id), event.clone()));
    }

    async fn send_chunk(&self, peer: &PeerId, response: Response<DagPayload>) -> anyhow::Result<()> {
        self.transport.send(peer, Message::DagStreamResponse(response)).await
    }
}

/// Pulls the open epoch
pub struct DagLeecherCallbacks {
    store: Arc<dyn Store>,
    transport: Arc<dyn PeerTransport>,
    progress: ProgressTable,
    fetcher: Arc<Fetcher>,
}

impl LeecherCallbacks for DagLeecherCallbacks {
    type Locator = IdLocator;

    fn name(&self) -> &'static str {
        "dag"
    }

    fn local_progress(&self) -> u64 {
        self.store.epoch() as u64
    }

    fn peer_progress(&self, peer: &PeerId) -> Option<u64> {
        self.progress.get(peer).map(|p| p.epoch as u64)
    }

    fn session_range(&self, local_progress: u64, _peer_progress: u64) -> (IdLocator, IdLocator) {
        let epoch = u32::try_from(local_progress).unwrap_or(u32::MAX);
        (
            IdLocator(EventId::epoch_start(epoch)),
            IdLocator(EventId::epoch_start(epoch.saturating_add(1))),
        )
    }

    fn request_type(&self, _local_progress: u64, _peer_progress: u64, try_: u32) -> u8 {
        if try_ % IDS_ONLY_EVERY == IDS_ONLY_EVERY - 1 {
            RequestType::Ids as u8
        } else {
            RequestType::Events as u8
        }
    }

    fn is_processed(&self, locator: &IdLocator) -> bool {
        self.store.is_processed(&locator.0)
    }

    fn request_chunk(&self, peer: &PeerId, request: Request<IdLocator>) -> anyhow::Result<()> {
        spawn_send(self.transport.clone(), peer.clone(), Message::DagStreamRequest(request.to_wire()))
    }

    fn suspend(&self, _peer: &PeerId) -> bool {
        self.fetcher.overloaded()
    }

    fn all_processed(&self) -> bool {
        !self.fetcher.overloaded()
    }
}

/// DAG stream leecher and seeder of a node
pub struct DagStream {
    leecher: Arc<Leecher<DagLeecherCallbacks>>,
    seeder: Seeder<DagSeederCallbacks>,
    fetcher: Arc<Fetcher>,
    transport: Arc<dyn PeerTransport>,
}

impl DagStream {
    /// Create a new DAG stream
    pub fn new(
        leecher_cfg: LeecherConfig,
        seeder_cfg: SeederConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn PeerTransport>,
        progress: ProgressTable,
        fetcher: Arc<Fetcher>,
    ) -> Self {
        let leecher = Leecher::new(
            leecher_cfg,
            Arc::new(DagLeecherCallbacks {
                store: store.clone(),
                transport: transport.clone(),
                progress,
                fetcher: fetcher.clone(),
            }),
        );
        let seeder = Seeder::new(
            seeder_cfg,
            Arc::new(DagSeederCallbacks {
                store,
                transport: transport.clone(),
            }),
        );
        Self {
            leecher: Arc::new(leecher),
            seeder,
            fetcher,
            transport,
        }
    }

    /// The leecher
    pub fn leecher(&self) -> &Arc<Leecher<DagLeecherCallbacks>> {
        &self.leecher
    }

    /// Start serving and syncing
    pub fn start(&self) {
        self.seeder.start();
        self.leecher.start();
    }

    /// Stop serving and syncing
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

    /// Serve a chunk request
    pub fn on_request(&self, peer: &PeerId, request: &WireRequest) -> Result<(), SyncError> {
        self.seeder.notify_request_received(peer, request)
    }

    /// Apply a chunk of the active session
    pub async fn on_response(&self, peer: &PeerId, response: Response<DagPayload>) -> Result<(), SyncError> {
        if !self.leecher.is_active_session(response.session_id) {
            trace!("dag stream: dropping chunk of stale session {} from {}", response.session_id, peer);
            return Ok(());
        }

        let last = response.payload.last_locator();
        let requester = events_requester(self.transport.clone(), peer.clone());
        let payload = response.payload;
        if payload.only_ids {
            if !payload.ids.is_empty() {
                self.fetcher.notify(peer, payload.ids, Instant::now(), requester).await?;
            }
        } else if !payload.events.is_empty() {
            self.fetcher.enqueue(peer, payload.events, Instant::now(), requester)?;
        }
        self.leecher.notify_chunk_received(response.session_id, last, response.done)
    }
}
