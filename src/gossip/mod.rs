//! Gossip handler
//!
//! Binds the fetcher, the three streams and the pack downloader of a node
//! to one store and one transport, and dispatches inbound messages to
//! them.

mod callbacks;
mod handler;

pub use callbacks::{StoreFetcherCallback, StorePacksCallback};
pub use handler::Handler;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_ms;

/// Most ids served per `GetEvents`
pub const MAX_GET_EVENTS: usize = 1024;
/// Most pack infos served per `GetPackInfos`
pub const MAX_GET_PACK_INFOS: usize = 128;

/// Handler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// How often own progress is announced to every peer
    #[serde(with = "duration_ms")]
    pub progress_interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl GossipConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.progress_interval.is_zero() {
            anyhow::bail!("progress_interval must be > 0");
        }
        Ok(())
    }
}
