//! Fetcher handle and event loop

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::state::{FetcherState, Injection, Notification};
use super::{EventsRequester, FetcherCallback, FetcherConfig};
use crate::error::SyncError;
use crate::eventcheck::HeavyCheck;
use crate::types::{Event, EventId, PeerId};

struct LoopParts {
    state: FetcherState,
    notify_rx: mpsc::Receiver<Notification>,
    inject_rx: mpsc::Receiver<Injection>,
}

/// Announcement-driven event fetcher
pub struct Fetcher {
    cfg: FetcherConfig,
    callback: Arc<dyn FetcherCallback>,
    heavy_check: Arc<dyn HeavyCheck>,
    notify_tx: mpsc::Sender<Notification>,
    inject_tx: mpsc::Sender<Injection>,
    announces: Arc<Mutex<HashMap<PeerId, usize>>>,
    announced_len: Arc<AtomicUsize>,
    parts: Mutex<Option<LoopParts>>,
    terminated: Arc<AtomicBool>,
    quit: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Fetcher {
    /// Create a new fetcher with an entropy-seeded random source
    pub fn new(cfg: FetcherConfig, callback: Arc<dyn FetcherCallback>, heavy_check: Arc<dyn HeavyCheck>) -> Self {
        Self::with_rng(cfg, callback, heavy_check, Box::new(StdRng::from_entropy()))
    }

    /// Create a new fetcher picking retry announcers with `rng`
    pub fn with_rng(
        cfg: FetcherConfig,
        callback: Arc<dyn FetcherCallback>,
        heavy_check: Arc<dyn HeavyCheck>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(cfg.max_queued_batches.max(1));
        let (inject_tx, inject_rx) = mpsc::channel(cfg.max_queued_injects.max(1));
        let announces = Arc::new(Mutex::new(HashMap::new()));
        let announced_len = Arc::new(AtomicUsize::new(0));
        let state = FetcherState::new(cfg.clone(), announces.clone(), announced_len.clone(), rng);
        let (quit, _) = watch::channel(false);
        Self {
            cfg,
            callback,
            heavy_check,
            notify_tx,
            inject_tx,
            announces,
            announced_len,
            parts: Mutex::new(Some(LoopParts {
                state,
                notify_rx,
                inject_rx,
            })),
            terminated: Arc::new(AtomicBool::new(false)),
            quit,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the event loop
    pub fn start(&self) {
        let parts = match self.parts.lock().take() {
            Some(parts) => parts,
            None => {
                warn!("Fetcher is already running");
                return;
            }
        };
        info!("Starting fetcher (hash limit: {})", self.cfg.hash_limit);

        let callback = self.callback.clone();
        let quit = self.quit.subscribe();
        let max_batch = self.cfg.max_batch.max(1);
        *self.handle.lock() = Some(tokio::spawn(run(parts, callback, quit, max_batch)));
    }

    /// Announce `ids` seen at `peer`; new ones are requested through
    /// `requester`
    ///
    /// A call that would push the peer over its announce budget is dropped
    /// as a whole.
    pub async fn notify(
        &self,
        peer: &PeerId,
        ids: Vec<EventId>,
        time: Instant,
        requester: EventsRequester,
    ) -> Result<(), SyncError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(SyncError::terminated("fetcher"));
        }
        let tracked = self.announces.lock().get(peer).copied().unwrap_or(0);
        if tracked + ids.len() > self.cfg.hash_limit {
            warn!(
                "Peer {} announced {} ids with {} already tracked, over the limit of {}",
                peer,
                ids.len(),
                tracked,
                self.cfg.hash_limit
            );
            return Ok(());
        }

        let mut quit = self.quit.subscribe();
        for chunk in ids.chunks(self.cfg.max_batch.max(1)) {
            let notification = Notification {
                peer: peer.clone(),
                ids: chunk.to_vec(),
                time,
                requester: requester.clone(),
            };
            tokio::select! {
                sent = self.notify_tx.send(notification) => {
                    sent.map_err(|_| SyncError::terminated("fetcher"))?;
                }
                _ = quit.changed() => return Err(SyncError::terminated("fetcher")),
            }
        }
        Ok(())
    }

    /// Check pushed events and hand the survivors to the heavy check
    ///
    /// A ban-class light check failure drops the peer and aborts the batch.
    pub fn enqueue(
        &self,
        peer: &PeerId,
        events: Vec<Event>,
        time: Instant,
        requester: EventsRequester,
    ) -> Result<(), SyncError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(SyncError::terminated("fetcher"));
        }

        let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
        let interested: HashSet<EventId> = self.callback.only_interested(&ids).into_iter().collect();

        let mut passed = Vec::with_capacity(interested.len());
        for event in events.into_iter().filter(|e| interested.contains(&e.id)) {
            match self.callback.check_light(&event) {
                Ok(()) => passed.push(event),
                Err(err) if err.is_ban() => {
                    warn!("Peer {} sent invalid event {}: {}", peer, event.id, err);
                    self.callback.drop_peer(peer);
                    return Err(SyncError::misbehaviour_with_peer(err.to_string(), peer.as_str()));
                }
                Err(err) => trace!("Skipping event {} from {}: {}", event.id, peer, err),
            }
        }
        if passed.is_empty() {
            return Ok(());
        }

        let peer = peer.clone();
        let callback = self.callback.clone();
        let inject_tx = self.inject_tx.clone();
        let terminated = self.terminated.clone();
        self.heavy_check.enqueue(
            passed,
            Box::new(move |events, results| {
                if terminated.load(Ordering::SeqCst) {
                    return;
                }
                let mut valid = Vec::with_capacity(events.len());
                for (event, result) in events.into_iter().zip(results) {
                    match result {
                        Ok(()) => valid.push(event),
                        Err(err) if err.is_ban() => {
                            warn!("Peer {} sent event {} failing heavy check: {}", peer, event.id, err);
                            callback.drop_peer(&peer);
                            return;
                        }
                        Err(err) => trace!("Skipping event {} from {}: {}", event.id, peer, err),
                    }
                }
                if valid.is_empty() {
                    return;
                }
                let count = valid.len();
                let injection = Injection {
                    peer: peer.clone(),
                    events: valid,
                    time,
                    requester,
                };
                if let Err(e) = inject_tx.try_send(injection) {
                    warn!("Dropping {} validated events from {}: {}", count, peer, SyncError::from(e));
                }
            }),
        )
    }

    /// Whether any queue is above 75% of its capacity
    pub fn overloaded(&self) -> bool {
        let busy = |tx_capacity: usize, max: usize| (max - tx_capacity.min(max)) > max * 3 / 4;
        busy(self.notify_tx.capacity(), self.cfg.max_queued_batches)
            || busy(self.inject_tx.capacity(), self.cfg.max_queued_injects)
            || self.announced_len.load(Ordering::SeqCst) > self.cfg.max_announced * 3 / 4
            || self.heavy_check.overloaded()
    }

    /// Whether input from `peer` should be throttled
    pub fn overloaded_peer(&self, peer: &PeerId) -> bool {
        self.overloaded() || self.announces.lock().get(peer).copied().unwrap_or(0) > self.cfg.hash_limit / 2
    }

    /// Tracked announce count of a peer
    pub fn peer_announces(&self, peer: &PeerId) -> usize {
        self.announces.lock().get(peer).copied().unwrap_or(0)
    }

    /// Stop the loop; no callback fires once this returns
    pub async fn stop(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.quit.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Fetcher loop panicked: {}", e);
            }
        }
        info!("Fetcher stopped");
    }
}

async fn run(parts: LoopParts, callback: Arc<dyn FetcherCallback>, mut quit: watch::Receiver<bool>, max_batch: usize) {
    let LoopParts {
        mut state,
        mut notify_rx,
        mut inject_rx,
    } = parts;

    loop {
        let deadline = state.next_deadline();
        let timer = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = quit.changed() => break,
            Some(notification) = notify_rx.recv() => {
                state.process_notification(notification, Instant::now(), callback.as_ref());
            }
            Some(mut injection) = inject_rx.recv() => {
                let parents = state.process_injection(&mut injection, callback.as_ref());
                if !parents.is_empty() {
                    trace!("Re-announcing {} missing parents from {}", parents.len(), injection.peer);
                }
                for chunk in parents.chunks(max_batch) {
                    let notification = Notification {
                        peer: injection.peer.clone(),
                        ids: chunk.to_vec(),
                        time: injection.time,
                        requester: injection.requester.clone(),
                    };
                    state.process_notification(notification, Instant::now(), callback.as_ref());
                }
            }
            _ = timer => {
                state.process_timer(Instant::now(), callback.as_ref());
            }
        }
    }
    debug!("Fetcher loop stopped ({} ids tracked)", state.announced_len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventcheck::heavycheck::{Checker, HashValidator, HeavyCheckConfig};
    use crate::eventcheck::{BasicCheck, CheckError, LightCheck};
    use crate::store::{EventStore, MemoryStore};
    use std::time::Duration;

    struct StoreCallback {
        store: MemoryStore,
        dropped: Mutex<Vec<PeerId>>,
    }

    impl FetcherCallback for StoreCallback {
        fn only_interested(&self, ids: &[EventId]) -> Vec<EventId> {
            self.store.only_interested(ids)
        }

        fn push_event(&self, _peer: &PeerId, event: Event) {
            let _ = self.store.insert_event(event);
        }

        fn check_light(&self, event: &Event) -> Result<(), CheckError> {
            BasicCheck::default().check(event)
        }

        fn drop_peer(&self, peer: &PeerId) {
            self.dropped.lock().push(peer.clone());
        }
    }

    fn setup() -> (Fetcher, Arc<StoreCallback>, Arc<Checker<HashValidator>>) {
        let cb = Arc::new(StoreCallback {
            store: MemoryStore::new(),
            dropped: Mutex::new(Vec::new()),
        });
        let checker = Arc::new(Checker::new(HeavyCheckConfig::default(), Arc::new(HashValidator)));
        checker.start();
        let fetcher = Fetcher::with_rng(
            FetcherConfig::default(),
            cb.clone(),
            checker.clone(),
            Box::new(StdRng::seed_from_u64(5)),
        );
        fetcher.start();
        (fetcher, cb, checker)
    }

    fn recorder() -> (EventsRequester, mpsc::UnboundedReceiver<Vec<EventId>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let requester: EventsRequester = Arc::new(move |ids: &[EventId]| {
            tx.send(ids.to_vec()).map_err(|_| anyhow::anyhow!("closed"))
        });
        (requester, rx)
    }

    #[tokio::test]
    async fn test_notify_requests_new_ids() {
        let (fetcher, _cb, checker) = setup();
        let (requester, mut rx) = recorder();
        let event = Event::new(1, 1, vec![], vec![1]);
        fetcher
            .notify(&PeerId::new("a"), vec![event.id], Instant::now(), requester)
            .await
            .unwrap();

        let requested = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(requested, vec![event.id]);
        fetcher.stop().await;
        checker.stop().await;
    }

    #[tokio::test]
    async fn test_notify_over_limit_is_dropped() {
        let (fetcher, _cb, checker) = setup();
        let (requester, mut rx) = recorder();
        let ids: Vec<EventId> = (0..3001).map(|i| EventId::new(1, i, [1; 24])).collect();
        let peer = PeerId::new("greedy");
        fetcher.notify(&peer, ids, Instant::now(), requester.clone()).await.unwrap();

        // the kept clone holds the channel open, so silence means nothing was requested
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        drop(requester);
        assert_eq!(fetcher.peer_announces(&peer), 0);
        fetcher.stop().await;
        checker.stop().await;
    }

    #[tokio::test]
    async fn test_enqueue_delivers_valid_events() {
        let (fetcher, cb, checker) = setup();
        let (requester, _rx) = recorder();
        let root = Event::new(1, 1, vec![], vec![1]);
        let child = Event::new(1, 2, vec![root.id], vec![2]);
        fetcher
            .enqueue(&PeerId::new("a"), vec![root.clone(), child.clone()], Instant::now(), requester)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while cb.store.event_count() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cb.store.has_event(&root.id));
        assert!(cb.store.has_event(&child.id));
        assert!(cb.dropped.lock().is_empty());
        fetcher.stop().await;
        checker.stop().await;
    }

    #[tokio::test]
    async fn test_injected_event_requests_missing_parent() {
        let (fetcher, cb, checker) = setup();
        let (requester, mut rx) = recorder();
        let parent = Event::new(1, 1, vec![], vec![1]);
        let child = Event::new(1, 2, vec![parent.id], vec![2]);
        fetcher
            .enqueue(&PeerId::new("a"), vec![child.clone()], Instant::now(), requester)
            .unwrap();

        let requested = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(requested, vec![parent.id]);
        assert!(cb.store.has_event(&child.id));
        fetcher.stop().await;
        checker.stop().await;
    }

    #[tokio::test]
    async fn test_light_check_ban_drops_peer() {
        let (fetcher, cb, checker) = setup();
        let (requester, _rx) = recorder();
        let parent = Event::new(1, 5, vec![], vec![]);
        let bad = Event::new(1, 5, vec![parent.id], vec![]);
        let err = fetcher
            .enqueue(&PeerId::new("evil"), vec![bad], Instant::now(), requester)
            .unwrap_err();
        assert!(err.is_ban());
        assert_eq!(*cb.dropped.lock(), vec![PeerId::new("evil")]);
        fetcher.stop().await;
        checker.stop().await;
    }

    #[tokio::test]
    async fn test_heavy_check_ban_drops_peer() {
        let (fetcher, cb, checker) = setup();
        let (requester, _rx) = recorder();
        let mut forged = Event::new(1, 1, vec![], vec![1]);
        forged.payload = vec![2];
        fetcher
            .enqueue(&PeerId::new("evil"), vec![forged.clone()], Instant::now(), requester)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while cb.dropped.lock().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*cb.dropped.lock(), vec![PeerId::new("evil")]);
        assert!(!cb.store.has_event(&forged.id));
        fetcher.stop().await;
        checker.stop().await;
    }

    #[tokio::test]
    async fn test_terminated_after_stop() {
        let (fetcher, _cb, checker) = setup();
        let (requester, _rx) = recorder();
        fetcher.stop().await;
        let err = fetcher
            .notify(&PeerId::new("a"), vec![], Instant::now(), requester.clone())
            .await
            .unwrap_err();
        assert!(err.is_terminated());
        assert!(fetcher
            .enqueue(&PeerId::new("a"), vec![], Instant::now(), requester)
            .unwrap_err()
            .is_terminated());
        checker.stop().await;
    }

    #[test]
    fn test_overloaded_peer() {
        let cb = Arc::new(StoreCallback {
            store: MemoryStore::new(),
            dropped: Mutex::new(Vec::new()),
        });
        let checker = Arc::new(Checker::new(HeavyCheckConfig::default(), Arc::new(HashValidator)));
        let fetcher = Fetcher::new(FetcherConfig::default(), cb, checker);
        let peer = PeerId::new("a");
        assert!(!fetcher.overloaded_peer(&peer));
        fetcher.announces.lock().insert(peer.clone(), super::super::HASH_LIMIT / 2 + 1);
        assert!(fetcher.overloaded_peer(&peer));
        assert!(!fetcher.overloaded());
    }
}
