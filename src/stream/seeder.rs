//! Generic stream seeder
//!
//! Server side of the session protocol. Requests are validated on the
//! caller's thread and served by a pool of sender tasks, which walk the
//! local ordered keyspace and emit bounded chunks back to the requester.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::SyncError;
use crate::stream::locator::Locator;
use crate::stream::payload::Payload;
use crate::stream::session::{Limit, Request, Response, WireRequest};
use crate::types::PeerId;

/// Sessions remembered per peer; the oldest is evicted beyond this
pub const MAX_SESSIONS_PER_PEER: usize = 3;

/// Seeder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeederConfig {
    /// Number of sender tasks
    pub sender_threads: usize,
    /// Capacity of the request queue
    pub max_sender_tasks: usize,
    /// Bytes of responses in flight before requests are rejected
    pub max_pending_responses_size: u64,
    /// Item cap of a single chunk
    pub max_response_payload_num: u32,
    /// Byte cap of a single chunk
    pub max_response_payload_size: u64,
    /// Chunks emitted per request
    pub max_response_chunks: u32,
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            sender_threads: 8,
            max_sender_tasks: 128,
            max_pending_responses_size: 64 * 1024 * 1024,
            max_response_payload_num: 16384,
            max_response_payload_size: 8 * 1024 * 1024,
            max_response_chunks: 12,
        }
    }
}

impl SeederConfig {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let fields = [
            ("sender_threads", self.sender_threads as u64),
            ("max_sender_tasks", self.max_sender_tasks as u64),
            ("max_pending_responses_size", self.max_pending_responses_size),
            ("max_response_payload_num", self.max_response_payload_num as u64),
            ("max_response_payload_size", self.max_response_payload_size),
            ("max_response_chunks", self.max_response_chunks as u64),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(SyncError::config_error_with_field("must be positive", field).into());
            }
        }
        Ok(())
    }
}

/// Domain hooks of a seeder
#[async_trait]
pub trait SeederCallbacks: Send + Sync + 'static {
    type Locator: Locator;
    type Payload: Payload<Locator = Self::Locator>;

    // ==================== Request Validation ====================

    /// Stream name for logs
    fn name(&self) -> &'static str;

    /// Whether a request type is known to this stream
    fn validate_request_type(&self, request_type: u8) -> bool;

    // ==================== Keyspace Access ====================

    /// Empty payload for a request type
    fn new_payload(&self, request_type: u8) -> Self::Payload;

    /// Walk local items in order starting at `start` until `f` returns false
    fn for_each_item(
        &self,
        start: &Self::Locator,
        request_type: u8,
        f: &mut dyn FnMut(Self::Locator, <Self::Payload as Payload>::Item) -> bool,
    );

    // ==================== Delivery ====================

    /// Send a chunk to the requesting peer
    async fn send_chunk(&self, peer: &PeerId, response: Response<Self::Payload>) -> anyhow::Result<()>;
}

/// Position of a served session
struct SeederSession<L> {
    id: u32,
    /// Next locator to serve; `None` once the range is exhausted
    next: Option<L>,
    stop: L,
}

type SessionHandle<L> = Arc<tokio::sync::Mutex<SeederSession<L>>>;

struct SeederTask<L> {
    peer: PeerId,
    request: Request<L>,
}

struct SeederInner<C: SeederCallbacks> {
    cfg: SeederConfig,
    callbacks: Arc<C>,
    sessions: Mutex<HashMap<PeerId, VecDeque<(u32, SessionHandle<C::Locator>)>>>,
    pending_bytes: AtomicU64,
    terminated: AtomicBool,
}

/// Stream seeder for one keyspace
pub struct Seeder<C: SeederCallbacks> {
    inner: Arc<SeederInner<C>>,
    tasks: Mutex<Option<mpsc::Sender<SeederTask<C::Locator>>>>,
    receiver: Mutex<Option<mpsc::Receiver<SeederTask<C::Locator>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: SeederCallbacks> Seeder<C> {
    /// Create a new seeder; requests queue up until [`Seeder::start`]
    pub fn new(cfg: SeederConfig, callbacks: Arc<C>) -> Self {
        let (tx, rx) = mpsc::channel(cfg.max_sender_tasks.max(1));
        Self {
            inner: Arc::new(SeederInner {
                cfg,
                callbacks,
                sessions: Mutex::new(HashMap::new()),
                pending_bytes: AtomicU64::new(0),
                terminated: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the sender tasks
    pub fn start(&self) {
        let rx = match self.receiver.lock().take() {
            Some(rx) => Arc::new(tokio::sync::Mutex::new(rx)),
            None => {
                warn!("{} seeder is already running", self.inner.callbacks.name());
                return;
            }
        };

        let threads = self.inner.cfg.sender_threads.max(1);
        info!("Starting {} seeder with {} sender tasks", self.inner.callbacks.name(), threads);
        let mut workers = self.workers.lock();
        for _ in 0..threads {
            let inner = self.inner.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let task = rx.lock().await.recv().await;
                    let task = match task {
                        Some(task) => task,
                        None => break,
                    };
                    let peer = task.peer.clone();
                    if let Err(e) = inner.serve(task).await {
                        warn!("{} seeder: failed to serve {}: {}", inner.callbacks.name(), peer, e);
                    }
                }
            }));
        }
    }

    /// Validate and queue a request received from `peer`
    ///
    /// Malformed requests yield a ban-worthy `PeerMisbehaviour`; a full
    /// queue or too many pending response bytes yield `QueueFull`.
    pub fn notify_request_received(&self, peer: &PeerId, wire: &WireRequest) -> Result<(), SyncError> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(SyncError::terminated(format!("{} seeder", self.inner.callbacks.name())));
        }

        let request = Request::<C::Locator>::from_wire(wire).map_err(|e| e.with_peer(peer.as_str()))?;
        if !self.inner.callbacks.validate_request_type(request.request_type) {
            return Err(SyncError::misbehaviour_with_peer(
                format!("unknown request type {}", request.request_type),
                peer.as_str(),
            ));
        }

        if self.inner.pending_bytes.load(Ordering::SeqCst) >= self.inner.cfg.max_pending_responses_size {
            return Err(SyncError::queue_full(format!("{} seeder pending responses", self.inner.callbacks.name())));
        }

        let tasks = self.tasks.lock();
        let tx = tasks
            .as_ref()
            .ok_or_else(|| SyncError::terminated(format!("{} seeder", self.inner.callbacks.name())))?;
        trace!(
            "{} seeder: queued session {} request from {}",
            self.inner.callbacks.name(),
            request.session.id,
            peer
        );
        tx.try_send(SeederTask {
            peer: peer.clone(),
            request,
        })
        .map_err(|e| match e {
            TrySendError::Full(_) => SyncError::queue_full(format!("{} seeder tasks", self.inner.callbacks.name())),
            TrySendError::Closed(_) => SyncError::terminated(format!("{} seeder", self.inner.callbacks.name())),
        })
    }

    /// Forget every session of a peer
    pub fn notify_peer_dropped(&self, peer: &PeerId) {
        if self.inner.sessions.lock().remove(peer).is_some() {
            debug!("{} seeder: dropped sessions of {}", self.inner.callbacks.name(), peer);
        }
    }

    /// Number of sessions remembered for a peer
    pub fn session_count(&self, peer: &PeerId) -> usize {
        self.inner.sessions.lock().get(peer).map_or(0, VecDeque::len)
    }

    /// Bytes of responses currently being sent
    pub fn pending_bytes(&self) -> u64 {
        self.inner.pending_bytes.load(Ordering::SeqCst)
    }

    /// Stop accepting requests and wait for the sender tasks
    pub async fn stop(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tasks.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("{} seeder task panicked: {}", self.inner.callbacks.name(), e);
            }
        }
        self.inner.sessions.lock().clear();
        info!("{} seeder stopped", self.inner.callbacks.name());
    }
}

impl<C: SeederCallbacks> SeederInner<C> {
    fn session_for(&self, peer: &PeerId, request: &Request<C::Locator>) -> SessionHandle<C::Locator> {
        let mut sessions = self.sessions.lock();
        let list = sessions.entry(peer.clone()).or_default();
        if let Some((_, existing)) = list.iter().find(|(id, _)| *id == request.session.id) {
            return existing.clone();
        }

        if list.len() >= MAX_SESSIONS_PER_PEER {
            list.pop_front();
        }
        let session = Arc::new(tokio::sync::Mutex::new(SeederSession {
            id: request.session.id,
            next: Some(request.session.start.clone()),
            stop: request.session.stop.clone(),
        }));
        list.push_back((request.session.id, session.clone()));
        session
    }

    async fn serve(&self, task: SeederTask<C::Locator>) -> anyhow::Result<()> {
        let SeederTask { peer, request } = task;
        let handle = self.session_for(&peer, &request);
        let mut session = handle.lock().await;

        let chunks = request.max_chunks.min(self.cfg.max_response_chunks);
        let limit = Limit {
            num: request.limit.num.min(self.cfg.max_response_payload_num),
            size: request.limit.size.min(self.cfg.max_response_payload_size),
        };

        for _ in 0..chunks {
            if self.terminated.load(Ordering::SeqCst) {
                break;
            }
            let start = match session.next.clone() {
                Some(start) => start,
                None => break,
            };

            let (payload, next) = self.collect_chunk(&start, &session.stop, request.request_type, limit);
            let done = next.is_none();
            session.next = next;

            let mem = payload.total_mem_size();
            trace!(
                "{} seeder: session {} chunk of {} items to {} (done: {})",
                self.callbacks.name(),
                session.id,
                payload.len(),
                peer,
                done
            );
            self.pending_bytes.fetch_add(mem, Ordering::SeqCst);
            let result = self
                .callbacks
                .send_chunk(
                    &peer,
                    Response {
                        session_id: session.id,
                        done,
                        payload,
                    },
                )
                .await;
            self.pending_bytes.fetch_sub(mem, Ordering::SeqCst);
            result?;

            if done {
                debug!("{} seeder: session {} with {} exhausted", self.callbacks.name(), session.id, peer);
                break;
            }
        }
        Ok(())
    }

    /// Gather one chunk from `start`; also returns the locator to continue
    /// from, or `None` if the range ended inside this chunk
    fn collect_chunk(
        &self,
        start: &C::Locator,
        stop: &C::Locator,
        request_type: u8,
        limit: Limit,
    ) -> (C::Payload, Option<C::Locator>) {
        let mut payload = self.callbacks.new_payload(request_type);
        let mut next = None;
        self.callbacks.for_each_item(start, request_type, &mut |locator, item| {
            if locator >= *stop {
                return false;
            }
            if payload.len() as u64 >= limit.num as u64 || payload.total_size() >= limit.size {
                // resume right after the last item sent
                next = payload.last_locator().and_then(|last| last.inc()).or(Some(locator));
                return false;
            }
            payload.add_item(locator, item);
            true
        });
        (payload, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::leecher::{Leecher, LeecherCallbacks, LeecherConfig};
    use crate::stream::locator::IndexLocator;
    use crate::stream::session::Session;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::{BTreeMap, HashSet};
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, Default)]
    struct NumPayload {
        items: Vec<(IndexLocator, u64)>,
    }

    impl Payload for NumPayload {
        type Locator = IndexLocator;
        type Item = u64;

        fn add_item(&mut self, locator: IndexLocator, item: u64) {
            self.items.push((locator, item));
        }

        fn len(&self) -> usize {
            self.items.len()
        }

        fn total_size(&self) -> u64 {
            self.items.len() as u64 * 8
        }

        fn total_mem_size(&self) -> u64 {
            self.items.len() as u64 * 16
        }

        fn last_locator(&self) -> Option<IndexLocator> {
            self.items.last().map(|(l, _)| *l)
        }
    }

    struct NumSeeder {
        items: BTreeMap<u64, u64>,
        out: mpsc::UnboundedSender<(PeerId, Response<NumPayload>)>,
    }

    #[async_trait]
    impl SeederCallbacks for NumSeeder {
        type Locator = IndexLocator;
        type Payload = NumPayload;

        fn name(&self) -> &'static str {
            "num"
        }

        fn validate_request_type(&self, request_type: u8) -> bool {
            request_type == 0
        }

        fn new_payload(&self, _request_type: u8) -> NumPayload {
            NumPayload::default()
        }

        fn for_each_item(&self, start: &IndexLocator, _request_type: u8, f: &mut dyn FnMut(IndexLocator, u64) -> bool) {
            for (k, v) in self.items.range(start.0..) {
                if !f(IndexLocator(*k), *v) {
                    break;
                }
            }
        }

        async fn send_chunk(&self, peer: &PeerId, response: Response<NumPayload>) -> anyhow::Result<()> {
            self.out
                .send((peer.clone(), response))
                .map_err(|_| anyhow::anyhow!("receiver gone"))
        }
    }

    fn seeder(cfg: SeederConfig, items: u64) -> (Seeder<NumSeeder>, mpsc::UnboundedReceiver<(PeerId, Response<NumPayload>)>) {
        let (out, rx) = mpsc::unbounded_channel();
        let cb = NumSeeder {
            items: (0..items).map(|i| (i, i * 10)).collect(),
            out,
        };
        (Seeder::new(cfg, Arc::new(cb)), rx)
    }

    fn wire(id: u32, start: u64, stop: u64, num: u32, chunks: u32) -> WireRequest {
        Request {
            session: Session {
                id,
                start: IndexLocator(start),
                stop: IndexLocator(stop),
            },
            limit: Limit { num, size: 1 << 20 },
            request_type: 0,
            max_chunks: chunks,
        }
        .to_wire()
    }

    #[tokio::test]
    async fn test_serves_chunks_in_order() {
        let (seeder, mut rx) = seeder(SeederConfig::default(), 10);
        seeder.start();
        let peer = PeerId::new("p");
        seeder.notify_request_received(&peer, &wire(1, 0, 10, 4, 5)).unwrap();

        let mut chunks = Vec::new();
        while let Ok(Some((_, resp))) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            chunks.push(resp);
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].payload.len(), 4);
        assert_eq!(chunks[2].payload.len(), 2);
        assert!(!chunks[0].done && !chunks[1].done && chunks[2].done);
        assert_eq!(chunks[2].payload.last_locator(), Some(IndexLocator(9)));
        seeder.stop().await;
    }

    #[tokio::test]
    async fn test_session_continues_across_requests() {
        let (seeder, mut rx) = seeder(SeederConfig::default(), 10);
        seeder.start();
        let peer = PeerId::new("p");
        seeder.notify_request_received(&peer, &wire(1, 0, 10, 3, 1)).unwrap();
        let (_, first) = rx.recv().await.unwrap();
        seeder.notify_request_received(&peer, &wire(1, 0, 10, 3, 1)).unwrap();
        let (_, second) = rx.recv().await.unwrap();
        assert_eq!(first.payload.last_locator(), Some(IndexLocator(2)));
        assert_eq!(second.payload.items[0].0, IndexLocator(3));
        seeder.stop().await;
    }

    #[tokio::test]
    async fn test_sparse_keys_resume_after_last_sent() {
        let (out, mut rx) = mpsc::unbounded_channel();
        let cb = NumSeeder {
            items: (0..10).map(|i| (i * 10, i)).collect(),
            out,
        };
        let seeder = Seeder::new(SeederConfig::default(), Arc::new(cb));
        seeder.start();
        seeder.notify_request_received(&PeerId::new("p"), &wire(1, 0, 100, 3, 5)).unwrap();

        let mut chunks = Vec::new();
        while let Ok(Some((_, resp))) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            chunks.push(resp);
        }
        assert_eq!(chunks.len(), 4);
        let keys: Vec<u64> = chunks.iter().flat_map(|c| c.payload.items.iter().map(|(l, _)| l.0)).collect();
        assert_eq!(keys, (0..10).map(|i| i * 10).collect::<Vec<_>>());
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
        assert!(chunks[3].done);
        seeder.stop().await;
    }

    #[tokio::test]
    async fn test_empty_range_is_done_immediately() {
        let (seeder, mut rx) = seeder(SeederConfig::default(), 10);
        seeder.start();
        seeder.notify_request_received(&PeerId::new("p"), &wire(1, 20, 30, 3, 4)).unwrap();
        let (_, resp) = rx.recv().await.unwrap();
        assert!(resp.done);
        assert!(resp.payload.is_empty());
        seeder.stop().await;
    }

    #[test]
    fn test_rejects_malformed_requests() {
        let (seeder, _rx) = seeder(SeederConfig::default(), 10);
        let peer = PeerId::new("bad");

        let mut bad_type = wire(1, 0, 10, 3, 1);
        bad_type.request_type = 9;
        let err = seeder.notify_request_received(&peer, &bad_type).unwrap_err();
        assert!(err.is_ban());
        assert!(err.to_string().contains("bad"));

        let mut bad_locator = wire(1, 0, 10, 3, 1);
        bad_locator.session.start.truncate(3);
        assert!(seeder.notify_request_received(&peer, &bad_locator).unwrap_err().is_ban());

        assert!(seeder.notify_request_received(&peer, &wire(1, 0, 10, 0, 1)).unwrap_err().is_ban());
        assert!(seeder.notify_request_received(&peer, &wire(1, 0, 10, 3, 0)).unwrap_err().is_ban());
    }

    #[test]
    fn test_full_queue_is_backpressure() {
        let cfg = SeederConfig {
            max_sender_tasks: 1,
            ..SeederConfig::default()
        };
        let (seeder, _rx) = seeder(cfg, 10);
        let peer = PeerId::new("p");
        seeder.notify_request_received(&peer, &wire(1, 0, 10, 3, 1)).unwrap();
        let err = seeder.notify_request_received(&peer, &wire(1, 0, 10, 3, 1)).unwrap_err();
        assert!(err.is_backpressure());
        assert!(!err.is_ban());
    }

    #[tokio::test]
    async fn test_terminated_after_stop() {
        let (seeder, _rx) = seeder(SeederConfig::default(), 10);
        seeder.start();
        seeder.stop().await;
        let err = seeder.notify_request_received(&PeerId::new("p"), &wire(1, 0, 10, 3, 1)).unwrap_err();
        assert!(err.is_terminated());
    }

    #[tokio::test]
    async fn test_sessions_per_peer_are_capped() {
        let (seeder, mut rx) = seeder(SeederConfig::default(), 100);
        seeder.start();
        let peer = PeerId::new("p");
        for id in 0..5 {
            seeder.notify_request_received(&peer, &wire(id, 0, 100, 1, 1)).unwrap();
            rx.recv().await.unwrap();
        }
        assert_eq!(seeder.session_count(&peer), MAX_SESSIONS_PER_PEER);
        seeder.notify_peer_dropped(&peer);
        assert_eq!(seeder.session_count(&peer), 0);
        seeder.stop().await;
    }

    struct NumLeecher {
        total: u64,
        processed: Mutex<HashSet<u64>>,
        seeder: Arc<Seeder<NumSeeder>>,
    }

    impl LeecherCallbacks for NumLeecher {
        type Locator = IndexLocator;

        fn name(&self) -> &'static str {
            "num"
        }

        fn local_progress(&self) -> u64 {
            0
        }

        fn peer_progress(&self, _peer: &PeerId) -> Option<u64> {
            Some(1)
        }

        fn session_range(&self, _local: u64, _remote: u64) -> (IndexLocator, IndexLocator) {
            (IndexLocator(0), IndexLocator(self.total))
        }

        fn is_processed(&self, locator: &IndexLocator) -> bool {
            self.processed.lock().contains(&locator.0)
        }

        fn request_chunk(&self, _peer: &PeerId, request: Request<IndexLocator>) -> anyhow::Result<()> {
            self.seeder
                .notify_request_received(&PeerId::new("leecher"), &request.to_wire())
                .map_err(Into::into)
        }

        fn session_done(&self, _window: u64) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_seeder_to_leecher_round_trip() {
        const M: u64 = 1000;
        let (seeder, mut rx) = seeder(SeederConfig::default(), M);
        let seeder = Arc::new(seeder);
        seeder.start();

        let mut cfg = LeecherConfig::default();
        cfg.session.default_chunk_items_num = 64;
        let cb = Arc::new(NumLeecher {
            total: M,
            processed: Mutex::new(HashSet::new()),
            seeder: seeder.clone(),
        });
        let leecher = Leecher::with_rng(cfg, cb.clone(), Box::new(StdRng::seed_from_u64(7)));
        leecher.register_peer(PeerId::new("seeder"));
        leecher.routine(Instant::now());
        let session_id = leecher.session_snapshot().unwrap().id;

        let mut done_count = 0;
        let mut last_of_done = None;
        while let Ok(Some((_, resp))) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
            assert_eq!(resp.session_id, session_id);
            {
                let mut processed = cb.processed.lock();
                for (l, _) in &resp.payload.items {
                    processed.insert(l.0);
                }
            }
            if resp.done {
                done_count += 1;
                last_of_done = resp.payload.last_locator();
            }
            leecher
                .notify_chunk_received_at(resp.session_id, resp.payload.last_locator(), resp.done, Instant::now())
                .unwrap();
        }

        assert_eq!(done_count, 1);
        assert_eq!(last_of_done, Some(IndexLocator(M - 1)));
        assert_eq!(cb.processed.lock().len() as u64, M);
        assert!(!leecher.ongoing_session());
        assert_eq!(leecher.try_count(), 0);
        seeder.stop().await;
    }
}
