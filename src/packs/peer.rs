//! Per-peer pack sync state

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::{PacksCallback, PacksConfig, MAX_PACKS_NUM};
use crate::types::{EventId, PackInfo, PeerId};

/// Next request the binary search calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackRequest {
    /// Probe the info of a pack
    Info(u64),
    /// Download the ids of a pack
    Full(u64),
}

/// Pack sync state against one peer
///
/// Pack indices are 1-based. Everything at or below `connected_floor` is
/// known to be connected locally and has been pruned.
pub struct PeerPacksState {
    peer: PeerId,
    cfg: PacksConfig,
    epoch: u32,
    packs_num: u64,
    pack_infos: BTreeMap<u64, PackInfo>,
    fetching_info: HashMap<u64, Instant>,
    fetching_full: HashMap<u64, Instant>,
    prev_request: Option<Instant>,
    connected_floor: u64,
}

impl PeerPacksState {
    pub fn new(peer: PeerId, cfg: PacksConfig, epoch: u32) -> Self {
        Self {
            peer,
            cfg,
            epoch,
            packs_num: 0,
            pack_infos: BTreeMap::new(),
            fetching_info: HashMap::new(),
            fetching_full: HashMap::new(),
            prev_request: None,
            connected_floor: 0,
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn packs_num(&self) -> u64 {
        self.packs_num
    }

    pub fn connected_floor(&self) -> u64 {
        self.connected_floor
    }

    pub fn known_infos(&self) -> usize {
        self.pack_infos.len()
    }

    /// Whether a full pack request is still marked in flight
    pub fn is_fetching_full(&self, index: u64) -> bool {
        self.fetching_full.contains_key(&index)
    }

    /// Switch to another epoch, dropping everything known about the old one
    pub fn set_epoch(&mut self, epoch: u32) {
        if epoch == self.epoch {
            return;
        }
        debug!("Packs of {}: epoch {} -> {}", self.peer, self.epoch, epoch);
        self.epoch = epoch;
        self.packs_num = 0;
        self.pack_infos.clear();
        self.fetching_info.clear();
        self.fetching_full.clear();
        self.prev_request = None;
        self.connected_floor = 0;
    }

    /// Peer reports how many packs its epoch has
    pub fn on_packs_num(&mut self, epoch: u32, packs_num: u64) {
        if epoch != self.epoch {
            return;
        }
        if packs_num > MAX_PACKS_NUM {
            warn!("Peer {} claims {} packs in epoch {}", self.peer, packs_num, epoch);
            return;
        }
        if packs_num < self.packs_num {
            // Packs never shrink within an epoch
            warn!("Peer {} lowered packs num {} -> {}", self.peer, self.packs_num, packs_num);
            return;
        }
        self.packs_num = packs_num;
    }

    /// Pack infos arrived
    pub fn on_pack_infos(&mut self, epoch: u32, total_num: u64, infos: Vec<PackInfo>) {
        if epoch != self.epoch {
            trace!("Ignoring pack infos of epoch {} from {}", epoch, self.peer);
            return;
        }
        self.on_packs_num(epoch, total_num);
        for info in infos {
            if info.epoch != epoch || info.index == 0 || info.index > self.packs_num {
                continue;
            }
            self.fetching_info.remove(&info.index);
            if info.index > self.connected_floor {
                self.pack_infos.insert(info.index, info);
            }
        }
    }

    /// Full pack arrived; returns the ids to announce to the fetcher
    ///
    /// The in-flight marker stays until the pack is proven connected.
    pub fn on_pack(&mut self, epoch: u32, index: u64, ids: Vec<EventId>) -> Vec<EventId> {
        if epoch != self.epoch || index == 0 || index > self.packs_num {
            return Vec::new();
        }
        ids
    }

    /// Prune everything at or below the highest connected pack
    pub fn sweep_known(&mut self, cb: &dyn PacksCallback) {
        let highest = self
            .pack_infos
            .iter()
            .rev()
            .find(|(_, info)| cb.is_connected(info))
            .map(|(index, _)| *index);
        let Some(highest) = highest else {
            return;
        };

        for (index, info) in self.pack_infos.range(..highest) {
            if !cb.is_connected(info) {
                warn!(
                    "Pack {} of {} is not connected below connected pack {}",
                    index, self.peer, highest
                );
            }
        }
        self.pack_infos = self.pack_infos.split_off(&(highest + 1));
        self.fetching_info.retain(|index, _| *index > highest);
        self.fetching_full.retain(|index, _| *index > highest);
        self.connected_floor = self.connected_floor.max(highest);
    }

    /// Next request of the binary search, `None` when synced
    pub fn binary_search_req(&self, cb: &dyn PacksCallback) -> Option<PackRequest> {
        if self.packs_num == 0 {
            return None;
        }
        if self.pack_infos.is_empty() && self.connected_floor == 0 {
            return Some(PackRequest::Info(1));
        }

        let mut lower = self.connected_floor;
        let mut upper = self.packs_num.saturating_add(1);
        for (index, info) in self.pack_infos.iter().rev() {
            if cb.is_connected(info) {
                lower = lower.max(*index);
                break;
            }
            upper = upper.min(*index);
        }

        if upper <= lower.saturating_add(1) {
            if upper > self.packs_num {
                None
            } else {
                Some(PackRequest::Full(upper))
            }
        } else {
            Some(PackRequest::Info(lower + (upper - lower) / 2))
        }
    }

    /// Issue whatever requests the current state calls for
    pub fn try_to_sync(&mut self, now: Instant, cb: &dyn PacksCallback) {
        match self.binary_search_req(cb) {
            Some(PackRequest::Full(index)) => self.sync_full(index, now, cb),
            Some(PackRequest::Info(index)) => self.request_info_timed(index, now, cb),
            None => {
                let force = self
                    .prev_request
                    .map_or(true, |prev| now.saturating_duration_since(prev) >= self.cfg.force_sync_period);
                if force {
                    trace!("Probing {} for packs beyond {}", self.peer, self.packs_num);
                    self.request_info_timed(self.packs_num.saturating_add(1), now, cb);
                }
            }
        }
    }

    fn sync_full(&mut self, first: u64, now: Instant, cb: &dyn PacksCallback) {
        self.request_full_timed(first, now, cb);

        // Continue on infos already known to be unconnected
        let mut next = first.saturating_add(1);
        while self.full_in_flight(now) < self.cfg.max_fetching_full_packs && next <= self.packs_num {
            match self.pack_infos.get(&next) {
                Some(info) if !cb.is_connected(info) => {
                    self.request_full_timed(next, now, cb);
                    next += 1;
                }
                _ => break,
            }
        }

        let unknown = (next..=self.packs_num).find(|index| !self.pack_infos.contains_key(index));
        if let Some(index) = unknown {
            self.request_info_timed(index, now, cb);
        }
    }

    fn full_in_flight(&self, now: Instant) -> usize {
        self.fetching_full
            .values()
            .filter(|t| !self.expired(**t, now))
            .count()
    }

    fn expired(&self, sent: Instant, now: Instant) -> bool {
        now.saturating_duration_since(sent) >= self.cfg.arrive_timeout
    }

    fn request_info_timed(&mut self, index: u64, now: Instant, cb: &dyn PacksCallback) {
        if let Some(sent) = self.fetching_info.get(&index) {
            if !self.expired(*sent, now) {
                return;
            }
        }
        self.fetching_info.insert(index, now);
        self.prev_request = Some(now);
        trace!("Requesting pack info {} of epoch {} from {}", index, self.epoch, self.peer);
        if let Err(e) = cb.request_pack_infos(&self.peer, self.epoch, vec![index]) {
            warn!("Failed to request pack info from {}: {}", self.peer, e);
        }
    }

    fn request_full_timed(&mut self, index: u64, now: Instant, cb: &dyn PacksCallback) {
        if let Some(sent) = self.fetching_full.get(&index) {
            if !self.expired(*sent, now) {
                return;
            }
        }
        self.fetching_full.insert(index, now);
        self.prev_request = Some(now);
        debug!("Requesting pack {} of epoch {} from {}", index, self.epoch, self.peer);
        if let Err(e) = cb.request_pack(&self.peer, self.epoch, index) {
            warn!("Failed to request pack from {}: {}", self.peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::EventsRequester;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    /// Remote with `total` packs of which the first `connected` are
    /// present locally
    struct Remote {
        epoch: u32,
        total: u64,
        connected: Mutex<HashSet<u64>>,
        info_requests: Mutex<Vec<u64>>,
        pack_requests: Mutex<Vec<u64>>,
    }

    impl Remote {
        fn new(total: u64, connected: u64) -> Self {
            Self {
                epoch: 3,
                total,
                connected: Mutex::new((1..=connected).collect()),
                info_requests: Mutex::new(Vec::new()),
                pack_requests: Mutex::new(Vec::new()),
            }
        }

        fn info(&self, index: u64) -> PackInfo {
            PackInfo {
                epoch: self.epoch,
                index,
                heads: vec![],
                timestamp: 0,
            }
        }
    }

    impl PacksCallback for Remote {
        fn local_epoch(&self) -> u32 {
            self.epoch
        }

        fn is_connected(&self, info: &PackInfo) -> bool {
            self.connected.lock().contains(&info.index)
        }

        fn request_pack_infos(&self, _peer: &PeerId, _epoch: u32, indexes: Vec<u64>) -> anyhow::Result<()> {
            self.info_requests.lock().extend(indexes);
            Ok(())
        }

        fn request_pack(&self, _peer: &PeerId, _epoch: u32, index: u64) -> anyhow::Result<()> {
            self.pack_requests.lock().push(index);
            Ok(())
        }

        fn events_requester(&self, _peer: &PeerId) -> EventsRequester {
            Arc::new(|_: &[EventId]| Ok(()))
        }
    }

    fn state(remote: &Remote) -> PeerPacksState {
        let mut state = PeerPacksState::new(PeerId::new("remote"), PacksConfig::default(), remote.epoch);
        state.on_packs_num(remote.epoch, remote.total);
        state
    }

    /// Answer info probes until a full pack is requested; returns the
    /// number of rounds and the pack requested
    fn run_search(remote: &Remote, state: &mut PeerPacksState) -> (usize, u64) {
        let mut now = Instant::now();
        for round in 1..=64 {
            state.try_to_sync(now, remote);
            if let Some(first) = remote.pack_requests.lock().first().copied() {
                return (round, first);
            }
            let probes: Vec<u64> = remote.info_requests.lock().drain(..).collect();
            let infos = probes.into_iter().map(|i| remote.info(i)).collect();
            state.on_pack_infos(remote.epoch, remote.total, infos);
            state.sweep_known(remote);
            now += Duration::from_millis(10);
        }
        panic!("binary search did not converge");
    }

    #[test]
    fn test_binary_search_converges_in_log_rounds() {
        for (total, connected) in [(1000, 0), (1000, 1), (1000, 617), (1000, 999), (7, 3), (1, 0)] {
            let remote = Remote::new(total, connected);
            let mut state = state(&remote);
            let (rounds, first) = run_search(&remote, &mut state);
            assert_eq!(first, connected + 1, "total {} connected {}", total, connected);
            // ceil(log2(1001)) probes plus the final full request
            assert!(rounds <= 12, "{} rounds for total {} connected {}", rounds, total, connected);
        }
    }

    #[test]
    fn test_synced_peer_is_rechecked_after_force_period() {
        let remote = Remote::new(5, 5);
        let mut state = state(&remote);
        state.on_pack_infos(remote.epoch, 5, vec![remote.info(5)]);
        state.sweep_known(&remote);
        assert_eq!(state.connected_floor(), 5);
        assert_eq!(state.binary_search_req(&remote), None);

        let start = Instant::now();
        state.try_to_sync(start, &remote);
        assert_eq!(*remote.info_requests.lock(), vec![6]);

        remote.info_requests.lock().clear();
        state.try_to_sync(start + Duration::from_secs(1), &remote);
        assert!(remote.info_requests.lock().is_empty());

        state.try_to_sync(start + Duration::from_secs(31), &remote);
        assert_eq!(*remote.info_requests.lock(), vec![6]);
    }

    #[test]
    fn test_full_marker_cleared_only_when_connected() {
        let remote = Remote::new(10, 0);
        let mut state = state(&remote);
        let now = Instant::now();
        state.on_pack_infos(remote.epoch, 10, vec![remote.info(1)]);
        state.try_to_sync(now, &remote);
        assert_eq!(*remote.pack_requests.lock(), vec![1]);
        assert!(state.is_fetching_full(1));

        let ids = state.on_pack(remote.epoch, 1, vec![EventId::epoch_start(3)]);
        assert_eq!(ids.len(), 1);
        assert!(state.is_fetching_full(1));

        // Identical request suppressed inside the arrive window
        state.try_to_sync(now + Duration::from_millis(10), &remote);
        assert_eq!(*remote.pack_requests.lock(), vec![1]);

        remote.connected.lock().insert(1);
        state.sweep_known(&remote);
        assert!(!state.is_fetching_full(1));
        assert_eq!(state.connected_floor(), 1);
    }

    #[test]
    fn test_full_requests_continue_on_known_unconnected() {
        let remote = Remote::new(10, 2);
        let mut state = state(&remote);
        let infos = (2..=5).map(|i| remote.info(i)).collect();
        state.on_pack_infos(remote.epoch, 10, infos);
        state.sweep_known(&remote);

        state.try_to_sync(Instant::now(), &remote);
        assert_eq!(*remote.pack_requests.lock(), vec![3, 4]);
        // Prefetch of the next unknown info
        assert_eq!(*remote.info_requests.lock(), vec![6]);
    }

    #[test]
    fn test_epoch_change_resets_state() {
        let remote = Remote::new(10, 3);
        let mut state = state(&remote);
        state.on_pack_infos(remote.epoch, 10, vec![remote.info(3)]);
        state.sweep_known(&remote);
        assert_eq!(state.connected_floor(), 3);

        state.set_epoch(4);
        assert_eq!(state.epoch(), 4);
        assert_eq!(state.packs_num(), 0);
        assert_eq!(state.connected_floor(), 0);
        assert_eq!(state.known_infos(), 0);
    }

    #[test]
    fn test_absurd_packs_num_ignored() {
        let remote = Remote::new(10, 0);
        let mut state = state(&remote);
        state.on_packs_num(remote.epoch, u64::MAX);
        assert_eq!(state.packs_num(), 10);

        state.on_pack_infos(remote.epoch, u64::MAX, vec![remote.info(1)]);
        assert_eq!(state.packs_num(), 10);
        assert_eq!(state.binary_search_req(&remote), Some(PackRequest::Full(1)));
    }

    #[test]
    fn test_largest_packs_num_does_not_overflow() {
        let remote = Remote::new(MAX_PACKS_NUM, 0);
        let mut state = state(&remote);
        remote.connected.lock().insert(MAX_PACKS_NUM);
        state.on_pack_infos(remote.epoch, MAX_PACKS_NUM, vec![remote.info(MAX_PACKS_NUM)]);
        state.sweep_known(&remote);
        assert_eq!(state.connected_floor(), MAX_PACKS_NUM);
        assert_eq!(state.binary_search_req(&remote), None);

        state.try_to_sync(Instant::now(), &remote);
        assert_eq!(*remote.info_requests.lock(), vec![MAX_PACKS_NUM + 1]);
        assert!(remote.pack_requests.lock().is_empty());
    }

    #[test]
    fn test_wrong_epoch_traffic_ignored() {
        let remote = Remote::new(10, 0);
        let mut state = state(&remote);
        state.on_pack_infos(9, 10, vec![remote.info(1)]);
        assert_eq!(state.known_infos(), 0);
        assert!(state.on_pack(9, 1, vec![EventId::epoch_start(9)]).is_empty());
    }
}
