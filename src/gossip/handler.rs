//! Per-node message handler

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{StoreFetcherCallback, StorePacksCallback, MAX_GET_EVENTS, MAX_GET_PACK_INFOS};
use crate::config::Config;
use crate::error::SyncError;
use crate::eventcheck::heavycheck::{Checker, HashValidator};
use crate::fetcher::{Fetcher, FetcherConfig};
use crate::packs::{PacksDownloader, PacksEvent, MAX_PACKS_NUM};
use crate::protocols::bvstream::BvStream;
use crate::protocols::dagstream::DagStream;
use crate::protocols::epstream::EpStream;
use crate::protocols::{events_requester, ProgressTable};
use crate::store::Store;
use crate::transport::memnet::Inbox;
use crate::transport::{spawn_send, Message, PeerTransport};
use crate::types::{Event, PeerId, PeerProgress};

/// Sync machinery of one node
pub struct Handler {
    cfg: Config,
    store: Arc<dyn Store>,
    transport: Arc<dyn PeerTransport>,
    progress: ProgressTable,
    peers: RwLock<BTreeSet<PeerId>>,
    checker: Arc<Checker<HashValidator>>,
    fetcher: Arc<Fetcher>,
    dag: DagStream,
    bv: BvStream,
    ep: EpStream,
    packs: PacksDownloader,
    drops: Mutex<Option<mpsc::UnboundedReceiver<PeerId>>>,
    quit: watch::Sender<bool>,
}

impl Handler {
    /// Wire a node's components
    pub fn new(cfg: Config, store: Arc<dyn Store>, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let progress = ProgressTable::new();
        let (drops_tx, drops_rx) = mpsc::unbounded_channel();

        let checker = Arc::new(Checker::new(cfg.heavy_check.clone(), Arc::new(HashValidator)));
        let fetcher = Arc::new(Fetcher::new(
            FetcherConfig::default(),
            Arc::new(StoreFetcherCallback::new(store.clone(), drops_tx)),
            checker.clone(),
        ));
        let dag = DagStream::new(
            cfg.leecher.clone(),
            cfg.seeder.clone(),
            store.clone(),
            transport.clone(),
            progress.clone(),
            fetcher.clone(),
        );
        let bv = BvStream::new(
            cfg.leecher.clone(),
            cfg.seeder.clone(),
            store.clone(),
            transport.clone(),
            progress.clone(),
        );
        let ep = EpStream::new(
            cfg.leecher.clone(),
            cfg.seeder.clone(),
            store.clone(),
            transport.clone(),
            progress.clone(),
        );
        let packs = PacksDownloader::new(
            cfg.packs.clone(),
            Arc::new(StorePacksCallback::new(store.clone(), transport.clone())),
            fetcher.clone(),
        );
        let (quit, _) = watch::channel(false);

        Arc::new(Self {
            cfg,
            store,
            transport,
            progress,
            peers: RwLock::new(BTreeSet::new()),
            checker,
            fetcher,
            dag,
            bv,
            ep,
            packs,
            drops: Mutex::new(Some(drops_rx)),
            quit,
        })
    }

    pub fn id(&self) -> &PeerId {
        self.transport.local_id()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    /// Start every component
    pub fn start(&self) {
        info!("Starting sync handler {}", self.id());
        self.checker.start();
        self.fetcher.start();
        self.dag.start();
        self.bv.start();
        self.ep.start();
    }

    /// Stop every component
    pub async fn stop(&self) {
        let _ = self.quit.send(true);
        self.packs.stop().await;
        self.dag.stop().await;
        self.bv.stop().await;
        self.ep.stop().await;
        self.fetcher.stop().await;
        self.checker.stop().await;
        info!("Sync handler {} stopped", self.id());
    }

    /// Our own sync position
    pub fn local_progress(&self) -> PeerProgress {
        let epoch = self.store.epoch();
        PeerProgress {
            epoch,
            bv_epoch: self.store.block_votes_progress(),
            ep_epoch: self.store.epoch_packs_progress(),
            packs_num: self.store.packs_num(epoch),
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.read().iter().cloned().collect()
    }

    /// A peer connected
    pub fn add_peer(&self, peer: &PeerId) -> Result<(), SyncError> {
        if !self.peers.write().insert(peer.clone()) {
            return Ok(());
        }
        debug!("{}: peer {} joined", self.id(), peer);
        self.dag.register_peer(peer);
        self.bv.register_peer(peer);
        self.ep.register_peer(peer);
        self.packs.register_peer(peer)?;
        spawn_send(
            self.transport.clone(),
            peer.clone(),
            Message::ProgressAnnounce(self.local_progress()),
        )
        .map_err(|e| SyncError::transport_error_full("progress announce", peer.as_str(), e.to_string()))
    }

    /// A peer disconnected
    pub fn remove_peer(&self, peer: &PeerId) {
        if !self.peers.write().remove(peer) {
            return;
        }
        debug!("{}: peer {} left", self.id(), peer);
        self.dag.unregister_peer(peer);
        self.bv.unregister_peer(peer);
        self.ep.unregister_peer(peer);
        self.packs.unregister_peer(peer);
        self.progress.remove(peer);
    }

    /// Connect a locally created event and announce it to every peer
    pub fn emit_event(&self, event: Event) -> Result<(), SyncError> {
        let id = event.id;
        self.store.insert_event(event)?;
        for peer in self.peers() {
            spawn_send(self.transport.clone(), peer, Message::EventAnnounce { ids: vec![id] })
                .map_err(|e| SyncError::transport_error(e.to_string()))?;
        }
        Ok(())
    }

    fn broadcast_progress(&self) {
        let progress = self.local_progress();
        for peer in self.peers() {
            if let Err(e) = spawn_send(self.transport.clone(), peer, Message::ProgressAnnounce(progress)) {
                warn!("{}: failed to announce progress: {}", self.id(), e);
                return;
            }
        }
    }

    /// Process one inbound message
    pub async fn handle_message(&self, from: &PeerId, msg: Message) -> Result<(), SyncError> {
        if !self.peers.read().contains(from) {
            trace!("{}: ignoring {} from unknown peer {}", self.id(), msg.name(), from);
            return Ok(());
        }
        trace!("{}: {} from {}", self.id(), msg.name(), from);

        match msg {
            Message::ProgressAnnounce(progress) => {
                check_packs_num(from, progress.packs_num)?;
                self.progress.update(from, progress);
                self.packs.route(
                    from,
                    PacksEvent::PacksNum {
                        epoch: progress.epoch,
                        packs_num: progress.packs_num,
                    },
                )
            }
            Message::EventAnnounce { ids } => {
                if self.fetcher.overloaded_peer(from) {
                    trace!("{}: fetcher busy, dropping {} announces from {}", self.id(), ids.len(), from);
                    return Ok(());
                }
                let requester = events_requester(self.transport.clone(), from.clone());
                self.fetcher.notify(from, ids, Instant::now(), requester).await
            }
            Message::GetEvents { ids } => {
                if ids.len() > MAX_GET_EVENTS {
                    return Err(SyncError::misbehaviour_with_peer(
                        format!("requested {} events", ids.len()),
                        from.as_str(),
                    ));
                }
                let events: Vec<Event> = ids.iter().filter_map(|id| self.store.get_event(id)).collect();
                if events.is_empty() {
                    return Ok(());
                }
                self.reply(from, Message::Events { events })
            }
            Message::Events { events } => {
                if self.fetcher.overloaded_peer(from) {
                    trace!("{}: fetcher busy, dropping {} events from {}", self.id(), events.len(), from);
                    return Ok(());
                }
                let requester = events_requester(self.transport.clone(), from.clone());
                self.fetcher.enqueue(from, events, Instant::now(), requester)
            }
            Message::DagStreamRequest(request) => self.dag.on_request(from, &request),
            Message::DagStreamResponse(response) => self.dag.on_response(from, response).await,
            Message::BvStreamRequest(request) => self.bv.on_request(from, &request),
            Message::BvStreamResponse(response) => self.bv.on_response(from, response),
            Message::EpStreamRequest(request) => self.ep.on_request(from, &request),
            Message::EpStreamResponse(response) => self.ep.on_response(from, response),
            Message::GetPackInfos { epoch, indexes } => {
                if indexes.len() > MAX_GET_PACK_INFOS {
                    return Err(SyncError::misbehaviour_with_peer(
                        format!("requested {} pack infos", indexes.len()),
                        from.as_str(),
                    ));
                }
                let total_num = self.store.packs_num(epoch);
                let infos = indexes
                    .iter()
                    .filter_map(|index| self.store.pack_info(epoch, *index))
                    .collect();
                self.reply(
                    from,
                    Message::PackInfos {
                        epoch,
                        total_num,
                        infos,
                    },
                )
            }
            Message::PackInfos {
                epoch,
                total_num,
                infos,
            } => {
                check_packs_num(from, total_num)?;
                self.packs.route(
                    from,
                    PacksEvent::PackInfos {
                        epoch,
                        total_num,
                        infos,
                    },
                )
            }
            Message::GetPack { epoch, index } => match self.store.pack_ids(epoch, index) {
                Some(ids) => self.reply(from, Message::Pack { epoch, index, ids }),
                None => Ok(()),
            },
            Message::Pack { epoch, index, ids } => self.packs.route(from, PacksEvent::Pack { epoch, index, ids }),
        }
    }

    fn reply(&self, to: &PeerId, msg: Message) -> Result<(), SyncError> {
        spawn_send(self.transport.clone(), to.clone(), msg)
            .map_err(|e| SyncError::transport_error_full("reply", to.as_str(), e.to_string()))
    }

    fn on_error(&self, from: &PeerId, err: SyncError) {
        if err.is_ban() {
            warn!("{}: dropping peer {}: {}", self.id(), from, err);
            self.remove_peer(from);
        } else if err.is_terminated() || err.is_backpressure() {
            trace!("{}: {}", self.id(), err);
        } else {
            debug!("{}: message from {} failed: {}", self.id(), from, err);
        }
    }

    /// Drive the node: inbound messages, dropped peers and progress
    /// announces, until stopped or the inbox closes
    pub async fn run(self: Arc<Self>, mut inbox: Inbox) {
        let Some(mut drops) = self.drops.lock().take() else {
            warn!("{}: handler is already running", self.id());
            return;
        };
        let mut quit = self.quit.subscribe();
        let mut ticker = tokio::time::interval(self.cfg.gossip.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = quit.changed() => break,
                inbound = inbox.recv() => {
                    let Some((from, msg)) = inbound else { break };
                    if let Err(e) = self.handle_message(&from, msg).await {
                        self.on_error(&from, e);
                    }
                }
                Some(peer) = drops.recv() => {
                    warn!("{}: peer {} failed event checks", self.id(), peer);
                    self.remove_peer(&peer);
                }
                _ = ticker.tick() => self.broadcast_progress(),
            }
        }
        debug!("{}: handler loop finished", self.id());
    }
}

fn check_packs_num(from: &PeerId, packs_num: u64) -> Result<(), SyncError> {
    if packs_num > MAX_PACKS_NUM {
        return Err(SyncError::misbehaviour_with_peer(
            format!("claimed {} packs", packs_num),
            from.as_str(),
        ));
    }
    Ok(())
}
