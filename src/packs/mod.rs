//! Pack downloader
//!
//! Finds, per peer, the first pack of the current epoch that is not yet
//! connected locally by binary search over pack infos, then downloads
//! full packs from there and hands their ids to the fetcher.

mod downloader;
mod peer;

pub use downloader::PacksDownloader;
pub use peer::{PackRequest, PeerPacksState};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_ms;
use crate::fetcher::EventsRequester;
use crate::types::{EventId, PackInfo, PeerId};

/// Full packs requested at once from one peer
pub const MAX_FETCHING_FULL_PACKS: usize = 2;
/// Identical requests are not repeated within this window
pub const ARRIVE_TIMEOUT: Duration = Duration::from_millis(1000);
/// A synced peer is probed for new packs this often
pub const FORCE_SYNC_PERIOD: Duration = Duration::from_secs(30);
/// Per-peer loop period
pub const RECHECK_INTERVAL: Duration = Duration::from_millis(100);
/// Largest pack count a peer may claim for one epoch
pub const MAX_PACKS_NUM: u64 = 1 << 32;

/// Pack downloader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacksConfig {
    pub max_fetching_full_packs: usize,
    #[serde(with = "duration_ms")]
    pub arrive_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub force_sync_period: Duration,
    #[serde(with = "duration_ms")]
    pub recheck_interval: Duration,
}

impl Default for PacksConfig {
    fn default() -> Self {
        Self {
            max_fetching_full_packs: MAX_FETCHING_FULL_PACKS,
            arrive_timeout: ARRIVE_TIMEOUT,
            force_sync_period: FORCE_SYNC_PERIOD,
            recheck_interval: RECHECK_INTERVAL,
        }
    }
}

impl PacksConfig {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_fetching_full_packs == 0 {
            anyhow::bail!("max_fetching_full_packs must be > 0");
        }
        if self.arrive_timeout.is_zero() {
            anyhow::bail!("arrive_timeout must be > 0");
        }
        if self.force_sync_period.is_zero() {
            anyhow::bail!("force_sync_period must be > 0");
        }
        if self.recheck_interval.is_zero() {
            anyhow::bail!("recheck_interval must be > 0");
        }
        Ok(())
    }
}

/// Hooks the downloader calls back into
pub trait PacksCallback: Send + Sync + 'static {
    /// Epoch whose packs are being synced
    fn local_epoch(&self) -> u32;

    /// Whether every head of the pack is present locally
    fn is_connected(&self, info: &PackInfo) -> bool;

    /// Ask a peer for pack infos
    fn request_pack_infos(&self, peer: &PeerId, epoch: u32, indexes: Vec<u64>) -> anyhow::Result<()>;

    /// Ask a peer for the ids of a full pack
    fn request_pack(&self, peer: &PeerId, epoch: u32, index: u64) -> anyhow::Result<()>;

    /// Requester for event bodies announced by a pack
    fn events_requester(&self, peer: &PeerId) -> EventsRequester;
}

/// Pack traffic routed to a peer's downloader
#[derive(Debug, Clone)]
pub enum PacksEvent {
    /// Peer announced how many packs its current epoch has
    PacksNum { epoch: u32, packs_num: u64 },
    PackInfos {
        epoch: u32,
        total_num: u64,
        infos: Vec<PackInfo>,
    },
    Pack {
        epoch: u32,
        index: u64,
        ids: Vec<EventId>,
    },
}
