//! dag-gossip-sync
//!
//! Gossip-layer synchronization engine for a DAG of events: an
//! announcement-driven event fetcher, a generic stream session protocol
//! instantiated for DAG events, block votes and epoch packs, and a
//! binary-search pack downloader.

pub mod cli;
pub mod config;
pub mod error;
pub mod eventcheck;
pub mod fetcher;
pub mod gossip;
pub mod packs;
pub mod protocols;
pub mod sim;
pub mod store;
pub mod stream;
pub mod transport;
pub mod types;

pub use error::SyncError;

pub use cli::{CliArgs, RunConfig};
pub use config::Config;
pub use eventcheck::{CheckError, HeavyCheck, LightCheck};
pub use fetcher::{Fetcher, FetcherCallback, FetcherConfig};
pub use gossip::Handler;
pub use packs::{PacksCallback, PacksConfig, PacksDownloader};
pub use store::{MemoryStore, Store};
pub use stream::{Leecher, LeecherCallbacks, LeecherConfig, Seeder, SeederCallbacks, SeederConfig};
pub use transport::{Message, MemoryNetwork, PeerTransport};
pub use types::{Event, EventId, PeerId, PeerProgress};
