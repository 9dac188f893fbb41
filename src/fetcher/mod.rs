//! Event fetcher
//!
//! Turns hash announcements and pushed events into bounded, deduplicated
//! fetch requests. Every peer has an announce budget so one peer cannot
//! make us track unbounded state, and unanswered requests are retried
//! against another announcer.

mod fetcher;
mod state;

pub use fetcher::Fetcher;
pub use state::FetcherState;

use std::sync::Arc;
use std::time::Duration;

use crate::eventcheck::CheckError;
use crate::types::{Event, EventId, PeerId};

/// Maximum announces tracked per peer
pub const HASH_LIMIT: usize = 3000;
/// Announces older than this are dropped
pub const FORGET_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a request may stay unanswered
pub const ARRIVE_TIMEOUT: Duration = Duration::from_millis(1000);
/// Retries fire this much before the arrive timeout to batch them up
pub const GATHER_SLACK: Duration = Duration::from_millis(100);
/// Maximum ids per queued notification
pub const MAX_BATCH: usize = 256;
/// Capacity of the notification queue
pub const MAX_QUEUED_BATCHES: usize = 32;
/// Capacity of the injection queue
pub const MAX_QUEUED_INJECTS: usize = 128;
/// Maximum ids tracked overall
pub const MAX_ANNOUNCED: usize = 10 * HASH_LIMIT;

/// Issues a request for event bodies to the peer that announced them
pub type EventsRequester = Arc<dyn Fn(&[EventId]) -> anyhow::Result<()> + Send + Sync>;

/// Fetcher limits; the defaults are the safety constants above and are
/// only changed by tests
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub hash_limit: usize,
    pub forget_timeout: Duration,
    pub arrive_timeout: Duration,
    pub gather_slack: Duration,
    pub max_batch: usize,
    pub max_queued_batches: usize,
    pub max_queued_injects: usize,
    pub max_announced: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            hash_limit: HASH_LIMIT,
            forget_timeout: FORGET_TIMEOUT,
            arrive_timeout: ARRIVE_TIMEOUT,
            gather_slack: GATHER_SLACK,
            max_batch: MAX_BATCH,
            max_queued_batches: MAX_QUEUED_BATCHES,
            max_queued_injects: MAX_QUEUED_INJECTS,
            max_announced: MAX_ANNOUNCED,
        }
    }
}

impl FetcherConfig {
    /// Age of a request after which it is retried
    pub fn retry_after(&self) -> Duration {
        self.arrive_timeout.saturating_sub(self.gather_slack)
    }
}

/// Hooks the fetcher calls back into
pub trait FetcherCallback: Send + Sync + 'static {
    /// Subset of `ids` worth fetching
    fn only_interested(&self, ids: &[EventId]) -> Vec<EventId>;

    /// Hand over a validated event
    fn push_event(&self, peer: &PeerId, event: Event);

    /// Cheap synchronous check
    fn check_light(&self, event: &Event) -> Result<(), CheckError>;

    /// Disconnect a misbehaving peer
    fn drop_peer(&self, peer: &PeerId);
}
