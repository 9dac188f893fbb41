//! Generic stream leecher
//!
//! Client side of the session protocol. A leecher owns at most one active
//! session per keyspace, pulls one ordered range from one peer at a time,
//! rotates peers between attempts and restarts stalled sessions with a
//! backoff driven by the try counter.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::duration_ms;
use crate::error::SyncError;
use crate::stream::locator::Locator;
use crate::stream::pump::{ChunkPump, PumpCallbacks, SessionConfig};
use crate::stream::session::{Limit, Request, Session};
use crate::types::PeerId;

/// Lower bound of any watchdog window
pub const MIN_WATCHDOG: Duration = Duration::from_millis(1);

/// Every n-th try also considers peers that are not ahead of us
const PROBE_ALL_PEERS_EVERY: u32 = 5;

/// Session ids remembered to avoid reuse; seeders keep exhausted sessions
/// by id, a few per peer
const RECENT_SESSION_IDS: usize = 8;

/// Leecher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeecherConfig {
    /// Period of the session recheck
    #[serde(with = "duration_ms")]
    pub recheck_interval: Duration,
    /// Base window without any chunk before a session is abandoned
    #[serde(with = "duration_ms")]
    pub base_progress_watchdog: Duration,
    /// Base lifetime of a session
    #[serde(with = "duration_ms")]
    pub base_session_watchdog: Duration,
    /// Minimum pause between sessions, scaled by the try counter
    #[serde(with = "duration_ms")]
    pub min_session_restart: Duration,
    /// Maximum pause between sessions
    #[serde(with = "duration_ms")]
    pub max_session_restart: Duration,
    /// Per-session chunk pump settings
    pub session: SessionConfig,
}

impl Default for LeecherConfig {
    fn default() -> Self {
        Self {
            recheck_interval: Duration::from_secs(1),
            base_progress_watchdog: Duration::from_secs(5),
            base_session_watchdog: Duration::from_secs(150),
            min_session_restart: Duration::from_millis(500),
            max_session_restart: Duration::from_secs(30),
            session: SessionConfig::default(),
        }
    }
}

impl LeecherConfig {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let durations = [
            ("recheck_interval", self.recheck_interval),
            ("base_progress_watchdog", self.base_progress_watchdog),
            ("base_session_watchdog", self.base_session_watchdog),
            ("session.recheck_interval", self.session.recheck_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(SyncError::config_error_with_field("must be positive", field).into());
            }
        }
        if self.min_session_restart > self.max_session_restart {
            return Err(SyncError::config_error_with_field(
                "must not exceed max_session_restart",
                "min_session_restart",
            )
            .into());
        }
        if self.session.parallel_chunks_download == 0 {
            return Err(SyncError::config_error_with_field("must be at least 1", "session.parallel_chunks_download").into());
        }
        if self.session.default_chunk_items_num == 0 || self.session.default_chunk_items_size == 0 {
            return Err(SyncError::config_error_with_field("must be positive", "session.default_chunk_items").into());
        }
        Ok(())
    }
}

/// Watchdog window for a try: `base * 5 / (try + 5)`, never below
/// [`MIN_WATCHDOG`]
pub fn watchdog(base: Duration, try_: u32) -> Duration {
    let scaled = base.checked_mul(5).unwrap_or(Duration::MAX) / try_.saturating_add(5);
    scaled.max(MIN_WATCHDOG)
}

/// Pause after a session ended before the next one may start
pub fn restart_delay(cfg: &LeecherConfig, try_: u32) -> Duration {
    cfg.min_session_restart
        .saturating_mul(try_.saturating_add(1))
        .min(cfg.max_session_restart)
}

/// Session id mixing the window position with the try counter
pub fn session_id(window: u64, try_: u32) -> u32 {
    ((window as u32) << 12) ^ try_
}

/// Domain hooks of a leecher
pub trait LeecherCallbacks: Send + Sync + 'static {
    type Locator: Locator;

    /// Stream name for logs
    fn name(&self) -> &'static str;

    /// Our position in the keyspace
    fn local_progress(&self) -> u64;

    /// A peer's position in the keyspace, `None` if unknown
    fn peer_progress(&self, peer: &PeerId) -> Option<u64>;

    /// Range to pull in a session
    fn session_range(&self, local_progress: u64, peer_progress: u64) -> (Self::Locator, Self::Locator);

    /// Request type for a new session
    fn request_type(&self, _local_progress: u64, _peer_progress: u64, _try: u32) -> u8 {
        0
    }

    /// Whether an item was applied locally
    fn is_processed(&self, locator: &Self::Locator) -> bool;

    /// Send a chunk request to a peer
    fn request_chunk(&self, peer: &PeerId, request: Request<Self::Locator>) -> anyhow::Result<()>;

    /// Advisory pause for a peer
    fn suspend(&self, _peer: &PeerId) -> bool {
        false
    }

    /// Whether everything received so far was applied
    fn all_processed(&self) -> bool {
        true
    }

    /// Whether a session started at `window` has nothing left to pull
    fn session_done(&self, window: u64) -> bool {
        self.local_progress() > window
    }
}

/// Read-only view of the active session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub peer: PeerId,
    pub id: u32,
    pub try_: u32,
    pub start_time: Instant,
    pub last_received: Instant,
}

struct SessionState<L> {
    pump: Option<ChunkPump<L>>,
    peer: Option<PeerId>,
    id: u32,
    start_time: Instant,
    end_time: Option<Instant>,
    last_received: Instant,
    try_: u32,
    progress_mark: u64,
    received_items: bool,
}

struct LeecherState<L> {
    peers: BTreeSet<PeerId>,
    recent_ids: VecDeque<u32>,
    session: SessionState<L>,
    force_syncing: bool,
    terminated: bool,
    rng: Box<dyn RngCore + Send>,
}

/// Stream leecher for one keyspace
pub struct Leecher<C: LeecherCallbacks> {
    cfg: LeecherConfig,
    callbacks: Arc<C>,
    state: Mutex<LeecherState<C::Locator>>,
    quit: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: LeecherCallbacks> Leecher<C> {
    /// Create a new leecher with an entropy-seeded random source
    pub fn new(cfg: LeecherConfig, callbacks: Arc<C>) -> Self {
        Self::with_rng(cfg, callbacks, Box::new(StdRng::from_entropy()))
    }

    /// Create a new leecher with the given random source
    pub fn with_rng(cfg: LeecherConfig, callbacks: Arc<C>, rng: Box<dyn RngCore + Send>) -> Self {
        let (quit, _) = watch::channel(false);
        let now = Instant::now();
        Self {
            cfg,
            callbacks,
            state: Mutex::new(LeecherState {
                peers: BTreeSet::new(),
                recent_ids: VecDeque::with_capacity(RECENT_SESSION_IDS),
                session: SessionState {
                    pump: None,
                    peer: None,
                    id: 0,
                    start_time: now,
                    end_time: None,
                    last_received: now,
                    try_: 0,
                    progress_mark: 0,
                    received_items: false,
                },
                force_syncing: false,
                terminated: false,
                rng,
            }),
            quit,
            handle: Mutex::new(None),
        }
    }

    /// Get the leecher configuration
    pub fn config(&self) -> &LeecherConfig {
        &self.cfg
    }

    /// Add a peer to sync from
    pub fn register_peer(&self, peer: PeerId) {
        let mut st = self.state.lock();
        if st.peers.insert(peer.clone()) {
            debug!("{} leecher: added peer {} (total: {})", self.callbacks.name(), peer, st.peers.len());
        }
    }

    /// Remove a peer; a session bound to it is terminated
    pub fn unregister_peer(&self, peer: &PeerId, now: Instant) {
        let mut st = self.state.lock();
        st.peers.remove(peer);
        if st.session.peer.as_ref() == Some(peer) {
            debug!("{} leecher: session peer {} left", self.callbacks.name(), peer);
            self.terminate_locked(&mut st, now);
        }
    }

    /// Number of registered peers
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Bypass the wait-until-processed gate on the next recheck
    pub fn force_syncing(&self) {
        self.state.lock().force_syncing = true;
    }

    /// Current try counter
    pub fn try_count(&self) -> u32 {
        self.state.lock().session.try_
    }

    /// Snapshot of the active session, if any
    pub fn session_snapshot(&self) -> Option<SessionSnapshot> {
        let st = self.state.lock();
        st.session.pump.as_ref()?;
        Some(SessionSnapshot {
            peer: st.session.peer.clone()?,
            id: st.session.id,
            try_: st.session.try_,
            start_time: st.session.start_time,
            last_received: st.session.last_received,
        })
    }

    /// Whether a session is active
    pub fn ongoing_session(&self) -> bool {
        self.state.lock().session.pump.is_some()
    }

    /// Whether `session_id` tags the active session
    pub fn is_active_session(&self, session_id: u32) -> bool {
        let st = self.state.lock();
        st.session.pump.is_some() && st.session.id == session_id
    }

    /// Peers eligible for the next session; empty if none should start
    pub fn select_session_peer_candidates(&self, now: Instant) -> Vec<PeerId> {
        let st = self.state.lock();
        self.candidates_locked(&st, now)
    }

    /// Whether the active session should be abandoned
    pub fn should_terminate_session(&self, now: Instant) -> bool {
        let st = self.state.lock();
        self.should_terminate_locked(&st, now)
    }

    /// Start a session with a random candidate
    pub fn start_session(&self, candidates: &[PeerId], now: Instant) {
        let mut st = self.state.lock();
        self.start_session_locked(&mut st, candidates, now);
    }

    /// Terminate the active session, if any
    pub fn terminate_session(&self, now: Instant) {
        let mut st = self.state.lock();
        self.terminate_locked(&mut st, now);
    }

    /// Handle a chunk of the active session
    ///
    /// Chunks tagged with any other session id are ignored.
    pub fn notify_chunk_received(&self, session_id: u32, last: Option<C::Locator>, done: bool) -> Result<(), SyncError> {
        self.notify_chunk_received_at(session_id, last, done, Instant::now())
    }

    /// Same as [`Leecher::notify_chunk_received`] with an explicit clock
    pub fn notify_chunk_received_at(
        &self,
        session_id: u32,
        last: Option<C::Locator>,
        done: bool,
        now: Instant,
    ) -> Result<(), SyncError> {
        let mut st = self.state.lock();
        if st.terminated {
            return Err(SyncError::terminated(format!("{} leecher", self.callbacks.name())));
        }
        if st.session.pump.is_none() || st.session.id != session_id {
            trace!(
                "{} leecher: dropping chunk of stale session {} (active: {})",
                self.callbacks.name(),
                session_id,
                st.session.id
            );
            return Ok(());
        }

        st.session.last_received = now;
        if last.is_some() {
            st.session.received_items = true;
        }

        if done {
            let progressed = st.session.received_items || self.callbacks.local_progress() > st.session.progress_mark;
            debug!(
                "{} leecher: session {} done (progress: {})",
                self.callbacks.name(),
                session_id,
                progressed
            );
            self.terminate_locked(&mut st, now);
            if progressed {
                st.session.try_ = 0;
            }
            return Ok(());
        }

        if let Some(pump) = st.session.pump.as_mut() {
            pump.notify_chunk_received(last, now);
        }
        Ok(())
    }

    /// Periodic recheck: sweep or terminate the active session, or start a
    /// new one
    pub fn routine(&self, now: Instant) {
        let mut st = self.state.lock();
        if st.terminated {
            return;
        }
        if st.session.pump.is_some() {
            if let Some(pump) = st.session.pump.as_mut() {
                pump.sweep(now);
            }
            if self.should_terminate_locked(&st, now) {
                let advanced = self.callbacks.local_progress() > st.session.progress_mark;
                self.terminate_locked(&mut st, now);
                if advanced {
                    st.session.try_ = 0;
                }
            }
            return;
        }

        let candidates = self.candidates_locked(&st, now);
        if candidates.is_empty() {
            return;
        }
        self.start_session_locked(&mut st, &candidates, now);
    }

    /// Sweep the active session's pump only
    pub fn sweep_session(&self, now: Instant) {
        let mut st = self.state.lock();
        if let Some(pump) = st.session.pump.as_mut() {
            pump.sweep(now);
        }
    }

    /// Spawn the recheck loop
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            warn!("{} leecher is already running", self.callbacks.name());
            return;
        }

        let leecher = self.clone();
        let mut quit = self.quit.subscribe();
        let tick = self.cfg.session.recheck_interval.min(self.cfg.recheck_interval);
        info!("Starting {} leecher (recheck: {:?})", self.callbacks.name(), self.cfg.recheck_interval);

        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_routine: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = quit.changed() => break,
                    _ = interval.tick() => {
                        let now = Instant::now();
                        let due = last_routine.map_or(true, |t| now.duration_since(t) >= leecher.cfg.recheck_interval);
                        if due {
                            leecher.routine(now);
                            last_routine = Some(now);
                        } else {
                            leecher.sweep_session(now);
                        }
                    }
                }
            }
            debug!("{} leecher loop stopped", leecher.callbacks.name());
        }));
    }

    /// Stop the loop and drop the active session
    pub async fn stop(&self) {
        {
            let mut st = self.state.lock();
            if st.terminated {
                return;
            }
            st.terminated = true;
            self.terminate_locked(&mut st, Instant::now());
        }
        let _ = self.quit.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("{} leecher loop panicked: {}", self.callbacks.name(), e);
            }
        }
        info!("{} leecher stopped", self.callbacks.name());
    }

    fn candidates_locked(&self, st: &LeecherState<C::Locator>, now: Instant) -> Vec<PeerId> {
        if st.terminated || st.session.pump.is_some() {
            return Vec::new();
        }

        if let Some(end) = st.session.end_time {
            let since_end = now.saturating_duration_since(end);
            if since_end < restart_delay(&self.cfg, st.session.try_) {
                return Vec::new();
            }
            if !st.force_syncing && since_end < self.cfg.max_session_restart && !self.callbacks.all_processed() {
                trace!("{} leecher: waiting for local processing", self.callbacks.name());
                return Vec::new();
            }
        }

        let local = self.callbacks.local_progress();
        let mut ahead = Vec::new();
        let mut all = Vec::new();
        for peer in &st.peers {
            match self.callbacks.peer_progress(peer) {
                Some(progress) if progress > local => {
                    ahead.push(peer.clone());
                    all.push(peer.clone());
                }
                Some(progress) if progress == local => all.push(peer.clone()),
                _ => {}
            }
        }

        if !ahead.is_empty() && st.session.try_ % PROBE_ALL_PEERS_EVERY != PROBE_ALL_PEERS_EVERY - 1 {
            ahead
        } else {
            all
        }
    }

    fn should_terminate_locked(&self, st: &LeecherState<C::Locator>, now: Instant) -> bool {
        let pump = match st.session.pump.as_ref() {
            Some(pump) => pump,
            None => return false,
        };
        if pump.stopped() {
            return true;
        }
        let try_ = st.session.try_;
        let no_progress =
            now.saturating_duration_since(st.session.last_received) >= watchdog(self.cfg.base_progress_watchdog, try_);
        let stuck = now.saturating_duration_since(st.session.start_time) >= watchdog(self.cfg.base_session_watchdog, try_);
        if no_progress || stuck {
            debug!(
                "{} leecher: session {} watchdog fired (no progress: {}, stuck: {})",
                self.callbacks.name(),
                st.session.id,
                no_progress,
                stuck
            );
        }
        no_progress || stuck
    }

    fn start_session_locked(&self, st: &mut LeecherState<C::Locator>, candidates: &[PeerId], now: Instant) {
        if candidates.is_empty() || st.terminated || st.session.pump.is_some() {
            return;
        }

        let peer = candidates[st.rng.gen_range(0..candidates.len())].clone();
        let local = self.callbacks.local_progress();
        let remote = self.callbacks.peer_progress(&peer).unwrap_or(local);
        let mut try_ = st.session.try_;
        while st.recent_ids.contains(&session_id(local, try_)) {
            try_ = try_.wrapping_add(1);
        }
        st.session.try_ = try_;
        let (start, stop) = self.callbacks.session_range(local, remote);
        let request_type = self.callbacks.request_type(local, remote, try_);
        let session = Session {
            id: session_id(local, try_),
            start,
            stop,
        };

        info!(
            "Starting {} session {} with {} ({:?}..{:?}, try {})",
            self.callbacks.name(),
            session.id,
            peer,
            session.start,
            session.stop,
            try_
        );

        let id = session.id;
        let callbacks = PumpCallbacks {
            is_processed: {
                let cb = self.callbacks.clone();
                Box::new(move |locator: &C::Locator| cb.is_processed(locator))
            },
            request_chunks: {
                let cb = self.callbacks.clone();
                let peer = peer.clone();
                Box::new(move |num, size, chunks| {
                    cb.request_chunk(
                        &peer,
                        Request {
                            session: session.clone(),
                            limit: Limit { num, size },
                            request_type,
                            max_chunks: chunks,
                        },
                    )
                })
            },
            suspend: {
                let cb = self.callbacks.clone();
                let peer = peer.clone();
                Box::new(move || cb.suspend(&peer))
            },
            done: {
                let cb = self.callbacks.clone();
                Box::new(move || cb.session_done(local))
            },
        };

        let mut pump = ChunkPump::new(self.cfg.session.clone(), callbacks, now);
        pump.sweep(now);

        if st.recent_ids.len() >= RECENT_SESSION_IDS {
            st.recent_ids.pop_front();
        }
        st.recent_ids.push_back(id);

        st.session.pump = Some(pump);
        st.session.peer = Some(peer);
        st.session.id = id;
        st.session.start_time = now;
        st.session.last_received = now;
        st.session.progress_mark = local;
        st.session.received_items = false;
        st.force_syncing = false;
    }

    fn terminate_locked(&self, st: &mut LeecherState<C::Locator>, now: Instant) {
        if st.session.pump.take().is_none() {
            return;
        }
        let peer = st.session.peer.take();
        st.session.end_time = Some(now);
        st.session.try_ = st.session.try_.saturating_add(1);
        debug!(
            "{} leecher: terminated session {} with {:?} (next try {})",
            self.callbacks.name(),
            st.session.id,
            peer,
            st.session.try_
        );
    }
}
