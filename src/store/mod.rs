//! Store collaborators
//!
//! The sync engine only reads predicates and ordered ranges from the
//! store and hands it validated data. Implementations must be safe for
//! concurrent calls and reflect only applied state.

pub mod memory;

pub use memory::MemoryStore;

use crate::eventcheck::CheckError;
use crate::types::{BlockVotes, EpochPack, Event, EventId, PackInfo};

/// DAG events of the open epoch
pub trait EventStore: Send + Sync {
    /// Current (open) epoch
    fn epoch(&self) -> u32;

    /// Whether an event is stored
    fn has_event(&self, id: &EventId) -> bool;

    /// Get a stored event
    fn get_event(&self, id: &EventId) -> Option<Event>;

    /// Subset of `ids` worth fetching
    fn only_interested(&self, ids: &[EventId]) -> Vec<EventId>;

    /// Whether an event was applied
    fn is_processed(&self, id: &EventId) -> bool {
        self.has_event(id)
    }

    /// Apply a validated event
    fn insert_event(&self, event: Event) -> Result<(), CheckError>;

    /// Walk stored events in id order from `start` until `f` returns false
    fn for_each_event(&self, start: &EventId, f: &mut dyn FnMut(&Event) -> bool);
}

/// Event packs of an epoch
pub trait PackStore: Send + Sync {
    /// Highest pack index of an epoch
    fn packs_num(&self, epoch: u32) -> u64;

    /// Summary of a pack
    fn pack_info(&self, epoch: u32, index: u64) -> Option<PackInfo>;

    /// Event ids of a pack
    fn pack_ids(&self, epoch: u32, index: u64) -> Option<Vec<EventId>>;
}

/// Block-vote batches keyed by `(epoch << 32) | seq`
pub trait BlockVotesStore: Send + Sync {
    /// Lowest epoch without decided block votes
    fn block_votes_progress(&self) -> u32;

    fn has_block_votes(&self, key: u64) -> bool;

    fn for_each_block_votes(&self, start: u64, f: &mut dyn FnMut(&BlockVotes) -> bool);

    fn insert_block_votes(&self, bv: BlockVotes);
}

/// Epoch packs keyed by epoch
pub trait EpochPackStore: Send + Sync {
    /// Lowest epoch without an epoch pack
    fn epoch_packs_progress(&self) -> u32;

    fn has_epoch_pack(&self, epoch: u32) -> bool;

    fn for_each_epoch_pack(&self, start: u32, f: &mut dyn FnMut(&EpochPack) -> bool);

    fn insert_epoch_pack(&self, ep: EpochPack);
}

/// Everything a node needs
pub trait Store: EventStore + PackStore + BlockVotesStore + EpochPackStore {}

impl<T: EventStore + PackStore + BlockVotesStore + EpochPackStore> Store for T {}
