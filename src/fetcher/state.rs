//! Fetcher bookkeeping
//!
//! All maps are owned by the fetcher loop. Only the per-peer announce
//! counters are shared, so that `overloaded_peer` can be answered from
//! other threads.

use parking_lot::Mutex;
use rand::{Rng, RngCore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::{EventsRequester, FetcherCallback, FetcherConfig};
use crate::types::{Event, EventId, PeerId};

/// A batch of announced ids
pub(crate) struct Notification {
    pub peer: PeerId,
    pub ids: Vec<EventId>,
    pub time: Instant,
    pub requester: EventsRequester,
}

/// A batch of validated events
pub(crate) struct Injection {
    pub peer: PeerId,
    pub events: Vec<Event>,
    pub time: Instant,
    pub requester: EventsRequester,
}

#[derive(Clone)]
struct Announce {
    peer: PeerId,
    time: Instant,
    batch: u64,
    index: usize,
    requester: EventsRequester,
}

/// State of the fetcher loop
pub struct FetcherState {
    cfg: FetcherConfig,
    announced: HashMap<EventId, Vec<Announce>>,
    fetching: HashMap<EventId, Announce>,
    fetching_time: HashMap<EventId, Instant>,
    announces: Arc<Mutex<HashMap<PeerId, usize>>>,
    announced_len: Arc<AtomicUsize>,
    next_batch: u64,
    rng: Box<dyn RngCore + Send>,
}

impl FetcherState {
    /// Create a new state sharing the given counters
    pub(crate) fn new(
        cfg: FetcherConfig,
        announces: Arc<Mutex<HashMap<PeerId, usize>>>,
        announced_len: Arc<AtomicUsize>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            cfg,
            announced: HashMap::new(),
            fetching: HashMap::new(),
            fetching_time: HashMap::new(),
            announces,
            announced_len,
            next_batch: 0,
            rng,
        }
    }

    /// Number of tracked ids
    pub fn announced_len(&self) -> usize {
        self.announced.len()
    }

    /// Number of ids with an outstanding request
    pub fn fetching_len(&self) -> usize {
        self.fetching.len()
    }

    /// Whether an id has an outstanding request
    pub fn is_fetching(&self, id: &EventId) -> bool {
        self.fetching.contains_key(id)
    }

    /// Tracked announce count of a peer
    pub fn peer_announces(&self, peer: &PeerId) -> usize {
        self.announces.lock().get(peer).copied().unwrap_or(0)
    }

    /// Register announced ids and request the new ones from the announcer
    pub(crate) fn process_notification(&mut self, n: Notification, now: Instant, callback: &dyn FetcherCallback) {
        let tracked = self.peer_announces(&n.peer);
        if tracked + n.ids.len() > self.cfg.hash_limit {
            warn!(
                "Peer {} exceeded the announce limit ({} tracked + {} new)",
                n.peer,
                tracked,
                n.ids.len()
            );
            return;
        }
        if self.announced.len() + n.ids.len() > self.cfg.max_announced {
            debug!("Announced set full, dropping {} ids from {}", n.ids.len(), n.peer);
            return;
        }

        let ids = callback.only_interested(&n.ids);
        let batch = self.next_batch;
        self.next_batch += 1;

        let mut to_request = Vec::new();
        for (index, id) in ids.into_iter().enumerate() {
            let list = self.announced.entry(id).or_default();
            if list.iter().any(|a| a.peer == n.peer) {
                continue;
            }
            let announce = Announce {
                peer: n.peer.clone(),
                time: n.time,
                batch,
                index,
                requester: n.requester.clone(),
            };
            list.push(announce.clone());
            *self.announces.lock().entry(n.peer.clone()).or_insert(0) += 1;
            self.announced_len.fetch_add(1, Ordering::SeqCst);

            if !self.fetching.contains_key(&id) {
                self.fetching.insert(id, announce);
                self.fetching_time.insert(id, now);
                to_request.push(id);
            }
        }

        if !to_request.is_empty() {
            trace!("Requesting {} events from {} (batch {})", to_request.len(), n.peer, batch);
            self.request(&n.peer, &n.requester, &to_request);
        }
    }

    /// Deliver validated events; returns parents worth announcing again
    pub(crate) fn process_injection(&mut self, inj: &mut Injection, callback: &dyn FetcherCallback) -> Vec<EventId> {
        let events = std::mem::take(&mut inj.events);
        let mut parents = Vec::new();
        let mut seen = HashSet::new();
        for event in &events {
            for parent in &event.parents {
                if seen.insert(*parent) {
                    parents.push(*parent);
                }
            }
        }

        for event in events {
            self.forget(&event.id);
            callback.push_event(&inj.peer, event);
        }

        let candidates: Vec<EventId> = parents
            .into_iter()
            .filter(|id| !self.announced.contains_key(id) && !self.fetching.contains_key(id))
            .collect();
        if candidates.is_empty() {
            return candidates;
        }
        callback.only_interested(&candidates)
    }

    /// Drop stale ids and retry unanswered requests
    pub(crate) fn process_timer(&mut self, now: Instant, callback: &dyn FetcherCallback) {
        let mut ids: Vec<EventId> = self.announced.keys().copied().collect();
        ids.sort();

        let interested: HashSet<EventId> = callback.only_interested(&ids).into_iter().collect();
        let mut forgotten = 0;
        for id in &ids {
            let expired = self
                .announced
                .get(id)
                .and_then(|list| list.iter().map(|a| a.time).min())
                .map_or(true, |first| now.saturating_duration_since(first) >= self.cfg.forget_timeout);
            if expired || !interested.contains(id) {
                self.forget(id);
                forgotten += 1;
            }
        }
        if forgotten > 0 {
            debug!("Forgot {} announced ids", forgotten);
        }

        let retry_after = self.cfg.retry_after();
        let mut requests: Vec<(PeerId, EventsRequester, Vec<EventId>)> = Vec::new();
        for id in &ids {
            let timed_out = self
                .fetching_time
                .get(id)
                .map_or(false, |t| now.saturating_duration_since(*t) >= retry_after);
            if !timed_out {
                continue;
            }
            let announce = match self.announced.get(id) {
                Some(list) if !list.is_empty() => list[self.rng.gen_range(0..list.len())].clone(),
                _ => continue,
            };
            match requests.iter_mut().find(|(peer, _, _)| *peer == announce.peer) {
                Some((_, _, batch)) => batch.push(*id),
                None => requests.push((announce.peer.clone(), announce.requester.clone(), vec![*id])),
            }
            self.fetching.insert(*id, announce);
            self.fetching_time.insert(*id, now);
        }

        for (peer, requester, ids) in requests {
            debug!("Re-requesting {} events from {}", ids.len(), peer);
            self.request(&peer, &requester, &ids);
        }
    }

    /// Earliest moment the timer has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let retry_after = self.cfg.retry_after();
        let retries = self.fetching_time.values().map(|t| *t + retry_after);
        let forgets = self
            .announced
            .values()
            .filter_map(|list| list.iter().map(|a| a.time).min())
            .map(|t| t + self.cfg.forget_timeout);
        retries.chain(forgets).min()
    }

    /// Stop tracking an id
    pub fn forget(&mut self, id: &EventId) {
        if let Some(list) = self.announced.remove(id) {
            let mut announces = self.announces.lock();
            for announce in &list {
                if let Some(count) = announces.get_mut(&announce.peer) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        announces.remove(&announce.peer);
                    }
                }
            }
            self.announced_len.fetch_sub(list.len(), Ordering::SeqCst);
        }
        self.fetching.remove(id);
        self.fetching_time.remove(id);
    }

    fn request(&self, peer: &PeerId, requester: &EventsRequester, ids: &[EventId]) {
        for chunk in ids.chunks(self.cfg.max_batch.max(1)) {
            if let Err(e) = requester(chunk) {
                warn!("Failed to request {} events from {}: {}", chunk.len(), peer, e);
            }
        }
    }
}
