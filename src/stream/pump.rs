//! Per-session chunk pump
//!
//! Keeps a bounded number of chunks outstanding against one peer. A chunk
//! occupies its slot until it arrives and its last item has been processed
//! locally, so a slow local pipeline throttles the download.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::duration_ms;

/// Outstanding chunks are forgotten after this many pump rechecks without
/// any arrival, so a seeder that served fewer chunks than asked does not
/// wedge the session.
const STALL_RECHECKS: u32 = 50;

/// Chunk pump configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often the pump is swept
    #[serde(with = "duration_ms")]
    pub recheck_interval: Duration,
    /// Item count cap per requested chunk
    pub default_chunk_items_num: u32,
    /// Byte size cap per requested chunk
    pub default_chunk_items_size: u64,
    /// Maximum number of chunks outstanding at once
    pub parallel_chunks_download: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recheck_interval: Duration::from_millis(10),
            default_chunk_items_num: 500,
            default_chunk_items_size: 512 * 1024,
            parallel_chunks_download: 6,
        }
    }
}

/// Requests `chunks` chunks capped at (`num` items, `size` bytes) each
pub type ChunkRequester = Box<dyn Fn(u32, u64, u32) -> anyhow::Result<()> + Send + Sync>;

/// Hooks the pump calls back into
pub struct PumpCallbacks<L> {
    /// Whether an item was applied locally
    pub is_processed: Box<dyn Fn(&L) -> bool + Send + Sync>,
    /// Issues a chunked request to the session peer
    pub request_chunks: ChunkRequester,
    /// Advisory pause, e.g. when the peer is overloaded
    pub suspend: Box<dyn Fn() -> bool + Send + Sync>,
    /// Whether there is nothing left to pull
    pub done: Box<dyn Fn() -> bool + Send + Sync>,
}

/// Chunk pump bound to a single session
pub struct ChunkPump<L> {
    cfg: SessionConfig,
    callbacks: PumpCallbacks<L>,
    /// Requested, not yet arrived
    in_flight: u32,
    /// Arrived, last item not yet processed
    processing: VecDeque<L>,
    last_activity: Instant,
    received_chunks: u64,
    stopped: bool,
}

impl<L> ChunkPump<L> {
    /// Create a new pump
    pub fn new(cfg: SessionConfig, callbacks: PumpCallbacks<L>, now: Instant) -> Self {
        Self {
            cfg,
            callbacks,
            in_flight: 0,
            processing: VecDeque::new(),
            last_activity: now,
            received_chunks: 0,
            stopped: false,
        }
    }

    /// Whether the pump gave up or finished
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Stop requesting
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Number of chunks requested but not yet arrived
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Number of chunks received so far
    pub fn received_chunks(&self) -> u64 {
        self.received_chunks
    }

    /// Record an arrived chunk and request more if slots freed up
    pub fn notify_chunk_received(&mut self, last: Option<L>, now: Instant) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.received_chunks += 1;
        self.last_activity = now;
        if let Some(last) = last {
            if !(self.callbacks.is_processed)(&last) {
                self.processing.push_back(last);
            }
        }
        self.sweep(now);
    }

    /// Release processed chunks and top up outstanding requests
    pub fn sweep(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        if (self.callbacks.done)() {
            debug!("Chunk pump done after {} chunks", self.received_chunks);
            self.stopped = true;
            return;
        }

        let is_processed = &self.callbacks.is_processed;
        self.processing.retain(|last| !is_processed(last));

        if self.in_flight > 0 && now.duration_since(self.last_activity) >= self.cfg.recheck_interval * STALL_RECHECKS {
            debug!("Forgetting {} stalled chunk requests", self.in_flight);
            self.in_flight = 0;
        }

        if (self.callbacks.suspend)() {
            trace!("Chunk pump suspended");
            return;
        }

        let busy = self.in_flight + self.processing.len() as u32;
        if busy >= self.cfg.parallel_chunks_download {
            return;
        }
        let chunks = self.cfg.parallel_chunks_download - busy;
        match (self.callbacks.request_chunks)(self.cfg.default_chunk_items_num, self.cfg.default_chunk_items_size, chunks) {
            Ok(()) => {
                trace!("Requested {} chunks ({} busy)", chunks, busy);
                self.in_flight += chunks;
                self.last_activity = now;
            }
            Err(e) => {
                warn!("Failed to request chunks, stopping session pump: {}", e);
                self.stopped = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Harness {
        requests: Arc<Mutex<Vec<(u32, u64, u32)>>>,
        processed: Arc<Mutex<HashSet<u64>>>,
        fail: Arc<AtomicBool>,
        done: Arc<AtomicBool>,
    }

    fn pump(cfg: SessionConfig) -> (ChunkPump<u64>, Harness) {
        let h = Harness {
            requests: Arc::new(Mutex::new(Vec::new())),
            processed: Arc::new(Mutex::new(HashSet::new())),
            fail: Arc::new(AtomicBool::new(false)),
            done: Arc::new(AtomicBool::new(false)),
        };
        let requests = h.requests.clone();
        let processed = h.processed.clone();
        let fail = h.fail.clone();
        let done = h.done.clone();
        let callbacks = PumpCallbacks {
            is_processed: Box::new(move |l: &u64| processed.lock().contains(l)),
            request_chunks: Box::new(move |num, size, chunks| {
                if fail.load(Ordering::SeqCst) {
                    return Err(anyhow::anyhow!("send failed"));
                }
                requests.lock().push((num, size, chunks));
                Ok(())
            }),
            suspend: Box::new(|| false),
            done: Box::new(move || done.load(Ordering::SeqCst)),
        };
        (ChunkPump::new(cfg, callbacks, Instant::now()), h)
    }

    #[test]
    fn test_fills_parallel_slots() {
        let (mut p, h) = pump(SessionConfig::default());
        p.sweep(Instant::now());
        assert_eq!(p.in_flight(), 6);
        assert_eq!(h.requests.lock().as_slice(), &[(500, 512 * 1024, 6)]);

        // nothing more while all slots are busy
        p.sweep(Instant::now());
        assert_eq!(h.requests.lock().len(), 1);
    }

    #[test]
    fn test_unprocessed_chunk_holds_slot() {
        let (mut p, h) = pump(SessionConfig::default());
        let now = Instant::now();
        p.sweep(now);

        p.notify_chunk_received(Some(10), now);
        // chunk arrived but item 10 is not processed: slot stays busy
        assert_eq!(h.requests.lock().len(), 1);

        h.processed.lock().insert(10);
        p.sweep(now);
        assert_eq!(h.requests.lock().last(), Some(&(500, 512 * 1024, 1)));
    }

    #[test]
    fn test_request_failure_stops_pump() {
        let (mut p, h) = pump(SessionConfig::default());
        h.fail.store(true, Ordering::SeqCst);
        p.sweep(Instant::now());
        assert!(p.stopped());
    }

    #[test]
    fn test_done_stops_pump() {
        let (mut p, h) = pump(SessionConfig::default());
        h.done.store(true, Ordering::SeqCst);
        p.sweep(Instant::now());
        assert!(p.stopped());
        assert!(h.requests.lock().is_empty());
    }

    #[test]
    fn test_stalled_requests_are_forgotten() {
        let cfg = SessionConfig::default();
        let stall = cfg.recheck_interval * STALL_RECHECKS;
        let (mut p, h) = pump(cfg);
        let start = Instant::now();
        p.sweep(start);
        p.sweep(start + stall);
        assert_eq!(h.requests.lock().len(), 2);
        assert_eq!(p.in_flight(), 6);
    }
}
