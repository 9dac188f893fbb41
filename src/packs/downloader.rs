//! Pack downloader registry and per-peer loops

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{PacksCallback, PacksConfig, PacksEvent, PeerPacksState};
use crate::error::SyncError;
use crate::fetcher::Fetcher;
use crate::types::PeerId;

const PEER_QUEUE: usize = 64;

struct PeerLoop {
    tx: mpsc::Sender<PacksEvent>,
    quit: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs one pack sync loop per registered peer
pub struct PacksDownloader {
    cfg: PacksConfig,
    callback: Arc<dyn PacksCallback>,
    fetcher: Arc<Fetcher>,
    peers: Mutex<HashMap<PeerId, PeerLoop>>,
    terminated: AtomicBool,
}

impl PacksDownloader {
    pub fn new(cfg: PacksConfig, callback: Arc<dyn PacksCallback>, fetcher: Arc<Fetcher>) -> Self {
        Self {
            cfg,
            callback,
            fetcher,
            peers: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Start syncing packs from a peer
    pub fn register_peer(&self, peer: &PeerId) -> Result<(), SyncError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(SyncError::terminated("packs downloader"));
        }
        let mut peers = self.peers.lock();
        if peers.contains_key(peer) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        let (quit, quit_rx) = watch::channel(false);
        let state = PeerPacksState::new(peer.clone(), self.cfg.clone(), self.callback.local_epoch());
        let handle = tokio::spawn(run_peer(
            state,
            peer.clone(),
            self.cfg.clone(),
            self.callback.clone(),
            self.fetcher.clone(),
            rx,
            quit_rx,
        ));
        debug!("Registered packs peer {}", peer);
        peers.insert(peer.clone(), PeerLoop { tx, quit, handle });
        Ok(())
    }

    /// Stop syncing packs from a peer
    pub fn unregister_peer(&self, peer: &PeerId) {
        if let Some(peer_loop) = self.peers.lock().remove(peer) {
            let _ = peer_loop.quit.send(true);
            debug!("Unregistered packs peer {}", peer);
        }
    }

    /// Route pack traffic to the peer's loop
    ///
    /// Traffic of unknown peers is ignored, and a full peer queue drops
    /// the event since every request is retried.
    pub fn route(&self, peer: &PeerId, event: PacksEvent) -> Result<(), SyncError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(SyncError::terminated("packs downloader"));
        }
        let peers = self.peers.lock();
        let Some(peer_loop) = peers.get(peer) else {
            trace!("Dropping pack traffic of unregistered peer {}", peer);
            return Ok(());
        };
        if let Err(e) = peer_loop.tx.try_send(event) {
            warn!("Packs queue of {} rejected an event: {}", peer, e);
        }
        Ok(())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Stop every peer loop
    pub async fn stop(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let loops: Vec<(PeerId, PeerLoop)> = self.peers.lock().drain().collect();
        for (_, peer_loop) in &loops {
            let _ = peer_loop.quit.send(true);
        }
        for (peer, peer_loop) in loops {
            if let Err(e) = peer_loop.handle.await {
                warn!("Packs loop of {} panicked: {}", peer, e);
            }
        }
        info!("Packs downloader stopped");
    }
}

async fn run_peer(
    mut state: PeerPacksState,
    peer: PeerId,
    cfg: PacksConfig,
    callback: Arc<dyn PacksCallback>,
    fetcher: Arc<Fetcher>,
    mut rx: mpsc::Receiver<PacksEvent>,
    mut quit: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(cfg.recheck_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = quit.changed() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                state.set_epoch(callback.local_epoch());
                match event {
                    PacksEvent::PacksNum { epoch, packs_num } => state.on_packs_num(epoch, packs_num),
                    PacksEvent::PackInfos { epoch, total_num, infos } => {
                        state.on_pack_infos(epoch, total_num, infos);
                        state.sweep_known(callback.as_ref());
                    }
                    PacksEvent::Pack { epoch, index, ids } => {
                        let ids = state.on_pack(epoch, index, ids);
                        if ids.is_empty() {
                            continue;
                        }
                        trace!("Pack {} of {} announces {} ids", index, peer, ids.len());
                        let requester = callback.events_requester(&peer);
                        if let Err(e) = fetcher.notify(&peer, ids, Instant::now(), requester).await {
                            if e.is_terminated() {
                                break;
                            }
                            warn!("Failed to announce pack {} of {}: {}", index, peer, e);
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                state.set_epoch(callback.local_epoch());
                state.sweep_known(callback.as_ref());
                state.try_to_sync(Instant::now(), callback.as_ref());
            }
        }
    }
    debug!("Packs loop of {} stopped", peer);
}
