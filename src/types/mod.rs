//! Core types module
//!
//! DAG events, their identifiers, peer names and the coarse sync units.

pub mod event;
pub mod pack;
pub mod peer;

// Re-export main types
pub use event::{Event, EventId, EVENT_ID_LEN};
pub use pack::{block_votes_key, BlockVotes, EpochPack, PackInfo};
pub use peer::{PeerId, PeerProgress};
