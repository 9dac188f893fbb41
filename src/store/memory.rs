//! In-memory store
//!
//! Thread-safe store backing the simulator and the tests. An epoch is
//! sealed, and the next one opened, once its epoch pack is known and all
//! of its events are present.

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::{BlockVotesStore, EpochPackStore, EventStore, PackStore};
use crate::eventcheck::CheckError;
use crate::types::{block_votes_key, BlockVotes, EpochPack, Event, EventId, PackInfo};

/// First epoch of a fresh store
pub const FIRST_EPOCH: u32 = 1;

struct Pack {
    info: PackInfo,
    ids: Vec<EventId>,
}

struct Inner {
    epoch: u32,
    events: BTreeMap<EventId, Event>,
    epoch_counts: HashMap<u32, u32>,
    packs: HashMap<u32, Vec<Pack>>,
    block_votes: BTreeMap<u64, BlockVotes>,
    decided_votes: BTreeSet<u32>,
    epoch_packs: BTreeMap<u32, EpochPack>,
}

/// Thread-safe in-memory store
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store at the first epoch
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                epoch: FIRST_EPOCH,
                events: BTreeMap::new(),
                epoch_counts: HashMap::new(),
                packs: HashMap::new(),
                block_votes: BTreeMap::new(),
                decided_votes: BTreeSet::new(),
                epoch_packs: BTreeMap::new(),
            }),
        }
    }

    /// Number of stored events
    pub fn event_count(&self) -> usize {
        self.inner.read().events.len()
    }

    /// Number of stored events of an epoch
    pub fn epoch_event_count(&self, epoch: u32) -> u32 {
        self.inner.read().epoch_counts.get(&epoch).copied().unwrap_or(0)
    }

    /// Ids of every stored event
    pub fn event_ids(&self) -> Vec<EventId> {
        self.inner.read().events.keys().copied().collect()
    }

    /// Cut the stored events of `epoch` into packs of `pack_size` events
    /// in id order; returns the number of packs
    pub fn build_packs(&self, epoch: u32, pack_size: usize) -> u64 {
        let mut inner = self.inner.write();
        let start = EventId::epoch_start(epoch);
        let events: Vec<&Event> = inner
            .events
            .range(start..)
            .map(|(_, e)| e)
            .take_while(|e| e.epoch == epoch)
            .collect();

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let packs: Vec<Pack> = events
            .chunks(pack_size.max(1))
            .enumerate()
            .map(|(i, chunk)| {
                let ids: Vec<EventId> = chunk.iter().map(|e| e.id).collect();
                Pack {
                    info: PackInfo {
                        epoch,
                        index: i as u64 + 1,
                        heads: heads_of(chunk.iter().copied()),
                        timestamp,
                    },
                    ids,
                }
            })
            .collect();

        let num = packs.len() as u64;
        debug!("Built {} packs for epoch {}", num, epoch);
        inner.packs.insert(epoch, packs);
        num
    }

    fn try_seal(inner: &mut Inner) {
        loop {
            let epoch = inner.epoch;
            let sealed = match inner.epoch_packs.get(&epoch) {
                Some(ep) => {
                    inner.epoch_counts.get(&epoch).copied().unwrap_or(0) >= ep.event_count
                        && ep.heads.iter().all(|h| inner.events.contains_key(h))
                }
                None => false,
            };
            if !sealed {
                break;
            }
            inner.epoch += 1;
            info!("Sealed epoch {}, now at epoch {}", epoch, inner.epoch);
        }
    }
}

/// Events of a set that no other event of the set references
pub fn heads_of<'a>(events: impl Iterator<Item = &'a Event> + Clone) -> Vec<EventId> {
    let referenced: HashSet<EventId> = events.clone().flat_map(|e| e.parents.iter().copied()).collect();
    events.map(|e| e.id).filter(|id| !referenced.contains(id)).collect()
}

/// Seal of an epoch made of `events`
pub fn seal_of(epoch: u32, events: &[Event]) -> EpochPack {
    EpochPack {
        epoch,
        heads: heads_of(events.iter()),
        event_count: events.len() as u32,
    }
}

/// Generate a random epoch of `count` events, each with up to `parents`
/// parents picked among earlier events of the epoch
pub fn generate_epoch<R: Rng>(epoch: u32, count: usize, parents: usize, rng: &mut R) -> Vec<Event> {
    let mut events: Vec<Event> = Vec::with_capacity(count);
    for i in 0..count {
        let picked: Vec<EventId> = events
            .choose_multiple(rng, parents.min(events.len()))
            .map(|e| e.id)
            .collect();
        let mut payload = vec![0u8; 16];
        rng.fill(&mut payload[..]);
        events.push(Event::new(epoch, i as u32 + 1, picked, payload));
    }
    events
}

impl EventStore for MemoryStore {
    fn epoch(&self) -> u32 {
        self.inner.read().epoch
    }

    fn has_event(&self, id: &EventId) -> bool {
        self.inner.read().events.contains_key(id)
    }

    fn get_event(&self, id: &EventId) -> Option<Event> {
        self.inner.read().events.get(id).cloned()
    }

    fn only_interested(&self, ids: &[EventId]) -> Vec<EventId> {
        let inner = self.inner.read();
        ids.iter()
            .filter(|id| id.epoch() == inner.epoch && !inner.events.contains_key(id))
            .copied()
            .collect()
    }

    fn insert_event(&self, event: Event) -> Result<(), CheckError> {
        let mut inner = self.inner.write();
        if inner.events.contains_key(&event.id) {
            return Err(CheckError::AlreadyConnected);
        }
        if event.epoch != inner.epoch {
            return Err(CheckError::WrongEpoch {
                epoch: event.epoch,
                expected: inner.epoch,
            });
        }
        *inner.epoch_counts.entry(event.epoch).or_insert(0) += 1;
        inner.events.insert(event.id, event);
        Self::try_seal(&mut inner);
        Ok(())
    }

    fn for_each_event(&self, start: &EventId, f: &mut dyn FnMut(&Event) -> bool) {
        let inner = self.inner.read();
        for event in inner.events.range(*start..).map(|(_, e)| e) {
            if !f(event) {
                break;
            }
        }
    }
}

impl PackStore for MemoryStore {
    fn packs_num(&self, epoch: u32) -> u64 {
        self.inner.read().packs.get(&epoch).map_or(0, |p| p.len() as u64)
    }

    fn pack_info(&self, epoch: u32, index: u64) -> Option<PackInfo> {
        let inner = self.inner.read();
        let packs = inner.packs.get(&epoch)?;
        let pos = usize::try_from(index.checked_sub(1)?).ok()?;
        packs.get(pos).map(|p| p.info.clone())
    }

    fn pack_ids(&self, epoch: u32, index: u64) -> Option<Vec<EventId>> {
        let inner = self.inner.read();
        let packs = inner.packs.get(&epoch)?;
        let pos = usize::try_from(index.checked_sub(1)?).ok()?;
        packs.get(pos).map(|p| p.ids.clone())
    }
}

impl BlockVotesStore for MemoryStore {
    fn block_votes_progress(&self) -> u32 {
        let inner = self.inner.read();
        let mut epoch = FIRST_EPOCH;
        while inner.decided_votes.contains(&epoch) {
            epoch += 1;
        }
        epoch
    }

    fn has_block_votes(&self, key: u64) -> bool {
        self.inner.read().block_votes.contains_key(&key)
    }

    fn for_each_block_votes(&self, start: u64, f: &mut dyn FnMut(&BlockVotes) -> bool) {
        let inner = self.inner.read();
        for bv in inner.block_votes.range(start..).map(|(_, bv)| bv) {
            if !f(bv) {
                break;
            }
        }
    }

    fn insert_block_votes(&self, bv: BlockVotes) {
        let mut inner = self.inner.write();
        let epoch = bv.epoch;
        inner.block_votes.insert(bv.key(), bv);

        let last_seq = inner
            .block_votes
            .range(block_votes_key(epoch, 0)..=block_votes_key(epoch, u32::MAX))
            .find(|(_, bv)| bv.last)
            .map(|(_, bv)| bv.seq);
        if let Some(last_seq) = last_seq {
            let complete = (0..=last_seq).all(|seq| inner.block_votes.contains_key(&block_votes_key(epoch, seq)));
            if complete && inner.decided_votes.insert(epoch) {
                debug!("Block votes of epoch {} decided", epoch);
            }
        }
    }
}

impl EpochPackStore for MemoryStore {
    fn epoch_packs_progress(&self) -> u32 {
        let inner = self.inner.read();
        let mut epoch = FIRST_EPOCH;
        while inner.epoch_packs.contains_key(&epoch) {
            epoch += 1;
        }
        epoch
    }

    fn has_epoch_pack(&self, epoch: u32) -> bool {
        self.inner.read().epoch_packs.contains_key(&epoch)
    }

    fn for_each_epoch_pack(&self, start: u32, f: &mut dyn FnMut(&EpochPack) -> bool) {
        let inner = self.inner.read();
        for ep in inner.epoch_packs.range(start..).map(|(_, ep)| ep) {
            if !f(ep) {
                break;
            }
        }
    }

    fn insert_epoch_pack(&self, ep: EpochPack) {
        let mut inner = self.inner.write();
        inner.epoch_packs.entry(ep.epoch).or_insert(ep);
        Self::try_seal(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_generated_epoch_is_well_formed() {
        let events = generate_epoch(1, 50, 3, &mut rng());
        assert_eq!(events.len(), 50);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.lamport, i as u32 + 1);
            assert!(event.parents.len() <= 3);
            assert!(event.parents.iter().all(|p| p.lamport() < event.lamport));
            assert!(event.id_matches());
        }
    }

    #[test]
    fn test_epoch_seals_when_complete() {
        let store = MemoryStore::new();
        let events = generate_epoch(1, 20, 2, &mut rng());
        let seal = seal_of(1, &events);

        store.insert_epoch_pack(seal);
        for event in &events[..19] {
            store.insert_event(event.clone()).unwrap();
        }
        assert_eq!(store.epoch(), 1);
        store.insert_event(events[19].clone()).unwrap();
        assert_eq!(store.epoch(), 2);
        assert_eq!(store.epoch_packs_progress(), 2);
    }

    #[test]
    fn test_insert_rejects_duplicates_and_foreign_epochs() {
        let store = MemoryStore::new();
        let events = generate_epoch(1, 2, 1, &mut rng());
        store.insert_event(events[0].clone()).unwrap();
        assert_eq!(store.insert_event(events[0].clone()), Err(CheckError::AlreadyConnected));

        let foreign = generate_epoch(3, 1, 0, &mut rng());
        assert!(matches!(
            store.insert_event(foreign[0].clone()),
            Err(CheckError::WrongEpoch { epoch: 3, expected: 1 })
        ));
    }

    #[test]
    fn test_only_interested() {
        let store = MemoryStore::new();
        let events = generate_epoch(1, 3, 1, &mut rng());
        store.insert_event(events[0].clone()).unwrap();
        let other_epoch = EventId::new(2, 1, [0; 24]);
        let ids = vec![events[0].id, events[1].id, other_epoch, events[2].id];
        assert_eq!(store.only_interested(&ids), vec![events[1].id, events[2].id]);
    }

    #[test]
    fn test_packs_cover_epoch_in_order() {
        let store = MemoryStore::new();
        let events = generate_epoch(1, 25, 2, &mut rng());
        for event in &events {
            store.insert_event(event.clone()).unwrap();
        }
        assert_eq!(store.build_packs(1, 10), 3);
        assert_eq!(store.packs_num(1), 3);
        assert_eq!(store.pack_ids(1, 1).unwrap(), events[..10].iter().map(|e| e.id).collect::<Vec<_>>());
        assert_eq!(store.pack_ids(1, 3).unwrap().len(), 5);
        assert!(store.pack_info(1, 0).is_none());
        assert!(store.pack_info(1, 4).is_none());

        let info = store.pack_info(1, 2).unwrap();
        assert!(!info.heads.is_empty());
        // the last event of a pack is never referenced inside it
        assert!(info.heads.contains(&events[19].id));
    }

    #[test]
    fn test_block_votes_progress() {
        let store = MemoryStore::new();
        assert_eq!(store.block_votes_progress(), 1);
        let bv = |epoch, seq, last| BlockVotes {
            epoch,
            seq,
            last,
            votes: vec![1],
        };
        store.insert_block_votes(bv(1, 1, true));
        assert_eq!(store.block_votes_progress(), 1);
        store.insert_block_votes(bv(1, 0, false));
        assert_eq!(store.block_votes_progress(), 2);
        store.insert_block_votes(bv(3, 0, true));
        assert_eq!(store.block_votes_progress(), 2);

        let mut keys = Vec::new();
        store.for_each_block_votes(block_votes_key(1, 1), &mut |bv| {
            keys.push(bv.key());
            true
        });
        assert_eq!(keys, vec![block_votes_key(1, 1), block_votes_key(3, 0)]);
    }
}
