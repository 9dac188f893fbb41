//! In-process network simulation
//!
//! One seeding node holds a synthetic DAG: sealed epochs with their epoch
//! packs and block votes, plus an open epoch cut into packs. Fresh nodes
//! join and sync everything from scratch while the seeder optionally keeps
//! emitting new events of the open epoch.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gossip::Handler;
use crate::store::memory::{generate_epoch, seal_of, FIRST_EPOCH};
use crate::store::{BlockVotesStore, EpochPackStore, EventStore, MemoryStore, Store};
use crate::transport::MemoryNetwork;
use crate::types::{BlockVotes, Event, PeerId};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shape of a simulation run
#[derive(Debug, Clone)]
pub struct SimParams {
    /// Sealed epochs held by the seeder
    pub epochs: u32,
    pub events_per_epoch: usize,
    /// Parents per generated event, at most
    pub parents: usize,
    /// Events per pack of the open epoch
    pub pack_size: usize,
    /// Block-vote batches per sealed epoch
    pub vote_batches: u32,
    /// Fresh nodes
    pub leechers: usize,
    /// Events the seeder emits while the run is in progress
    pub live_events: usize,
    pub live_interval: Duration,
    /// Message loss probability
    pub loss: f64,
    pub timeout: Duration,
    pub seed: u64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            epochs: 3,
            events_per_epoch: 200,
            parents: 3,
            pack_size: 20,
            vote_batches: 3,
            leechers: 2,
            live_events: 0,
            live_interval: Duration::from_millis(20),
            loss: 0.0,
            timeout: Duration::from_secs(60),
            seed: 1,
        }
    }
}

impl SimParams {
    pub fn validate(&self) -> Result<()> {
        if self.events_per_epoch == 0 {
            anyhow::bail!("events_per_epoch must be > 0");
        }
        if self.pack_size == 0 {
            anyhow::bail!("pack_size must be > 0");
        }
        if self.leechers == 0 {
            anyhow::bail!("at least one leecher is required");
        }
        if !(0.0..1.0).contains(&self.loss) {
            anyhow::bail!("loss must be in [0, 1)");
        }
        Ok(())
    }
}

/// Final position of a node
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub id: PeerId,
    pub events: usize,
    pub epoch: u32,
    pub bv_epoch: u32,
    pub ep_epoch: u32,
}

/// Outcome of a run
#[derive(Debug, Clone)]
pub struct SimReport {
    pub complete: bool,
    pub elapsed: Duration,
    pub target: NodeReport,
    pub nodes: Vec<NodeReport>,
    pub delivered: u64,
    pub dropped: u64,
}

impl SimReport {
    /// Print a human-readable summary
    pub fn print(&self) {
        println!("Simulation {}", if self.complete { "complete" } else { "timed out" });
        println!("  Elapsed: {:.2?}", self.elapsed);
        println!(
            "  Seeder: {} events, epoch {}, block votes up to {}, epoch packs up to {}",
            self.target.events, self.target.epoch, self.target.bv_epoch, self.target.ep_epoch
        );
        for node in &self.nodes {
            println!(
                "  {}: {}/{} events, epoch {}, block votes up to {}, epoch packs up to {}",
                node.id, node.events, self.target.events, node.epoch, node.bv_epoch, node.ep_epoch
            );
        }
        println!("  Messages: {} delivered, {} dropped", self.delivered, self.dropped);
    }
}

struct Node {
    handler: Arc<Handler>,
    store: Arc<MemoryStore>,
    task: JoinHandle<()>,
}

impl Node {
    fn report(&self) -> NodeReport {
        NodeReport {
            id: self.handler.id().clone(),
            events: self.store.event_count(),
            epoch: self.store.epoch(),
            bv_epoch: self.store.block_votes_progress(),
            ep_epoch: self.store.epoch_packs_progress(),
        }
    }
}

fn node_synced(node: &NodeReport, target: &NodeReport) -> bool {
    node.events == target.events
        && node.epoch == target.epoch
        && node.bv_epoch == target.bv_epoch
        && node.ep_epoch == target.ep_epoch
}

/// Fill a store with sealed epochs and an open epoch; returns the open
/// epoch's events not yet inserted, for live emission
fn populate(store: &MemoryStore, params: &SimParams, rng: &mut StdRng) -> Result<Vec<Event>> {
    for epoch in FIRST_EPOCH..FIRST_EPOCH + params.epochs {
        let events = generate_epoch(epoch, params.events_per_epoch, params.parents, rng);
        for event in &events {
            store
                .insert_event(event.clone())
                .with_context(|| format!("inserting generated event {}", event.id))?;
        }
        for seq in 0..params.vote_batches {
            let mut votes = vec![0u8; 32];
            rng.fill(&mut votes[..]);
            store.insert_block_votes(BlockVotes {
                epoch,
                seq,
                last: seq + 1 == params.vote_batches,
                votes,
            });
        }
        store.insert_epoch_pack(seal_of(epoch, &events));
    }

    let open = store.epoch();
    let mut events = generate_epoch(open, params.events_per_epoch + params.live_events, params.parents, rng);
    let live = events.split_off(params.events_per_epoch);
    for event in events {
        store.insert_event(event).context("inserting open epoch event")?;
    }
    let packs = store.build_packs(open, params.pack_size);
    info!(
        "Seeder holds {} events: {} sealed epochs, open epoch {} with {} packs",
        store.event_count(),
        params.epochs,
        open,
        packs
    );
    Ok(live)
}

/// Run a simulation to completion or timeout
pub async fn run(cfg: &Config, params: &SimParams) -> Result<SimReport> {
    cfg.validate().context("Invalid configuration")?;
    params.validate().context("Invalid simulation parameters")?;

    let mut rng = StdRng::seed_from_u64(params.seed);
    let network = MemoryNetwork::new(params.loss, params.seed);

    let mut nodes = Vec::with_capacity(params.leechers + 1);
    for i in 0..=params.leechers {
        let id = if i == 0 {
            PeerId::new("seeder")
        } else {
            PeerId::new(format!("node-{}", i))
        };
        let store = Arc::new(MemoryStore::new());
        let (transport, inbox) = network.join(id);
        let handler = Handler::new(cfg.clone(), store.clone() as Arc<dyn Store>, transport);
        let task = tokio::spawn(handler.clone().run(inbox));
        nodes.push(Node { handler, store, task });
    }
    let live = populate(&nodes[0].store, params, &mut rng)?;

    for node in &nodes {
        node.handler.start();
    }
    for a in &nodes {
        for b in &nodes {
            if a.handler.id() != b.handler.id() {
                a.handler.add_peer(b.handler.id())?;
            }
        }
    }

    let seeder = nodes[0].handler.clone();
    let live_interval = params.live_interval;
    let emitter = tokio::spawn(async move {
        for event in live {
            tokio::time::sleep(live_interval).await;
            if let Err(e) = seeder.emit_event(event) {
                warn!("Failed to emit live event: {}", e);
            }
        }
        debug!("Live emission finished");
    });

    let start = Instant::now();
    let mut complete = false;
    while start.elapsed() < params.timeout {
        tokio::time::sleep(POLL_INTERVAL).await;
        if !emitter.is_finished() {
            continue;
        }
        let target = nodes[0].report();
        if nodes[1..].iter().all(|n| node_synced(&n.report(), &target)) {
            complete = true;
            break;
        }
    }
    let elapsed = start.elapsed();
    emitter.abort();

    let target = nodes[0].report();
    let reports: Vec<NodeReport> = nodes[1..].iter().map(Node::report).collect();
    for node in &nodes {
        node.handler.stop().await;
    }
    for node in nodes {
        if let Err(e) = node.task.await {
            warn!("Node loop panicked: {}", e);
        }
    }

    let (delivered, dropped) = network.stats();
    if complete {
        info!("All nodes synced in {:.2?}", elapsed);
    } else {
        warn!("Simulation timed out after {:.2?}", elapsed);
    }
    Ok(SimReport {
        complete,
        elapsed,
        target,
        nodes: reports,
        delivered,
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{LeecherConfig, SessionConfig};

    fn fast_config() -> Config {
        let mut cfg = Config::default();
        cfg.leecher = LeecherConfig {
            recheck_interval: Duration::from_millis(20),
            min_session_restart: Duration::from_millis(20),
            max_session_restart: Duration::from_millis(200),
            session: SessionConfig {
                recheck_interval: Duration::from_millis(5),
                ..SessionConfig::default()
            },
            ..LeecherConfig::default()
        };
        cfg.packs.recheck_interval = Duration::from_millis(20);
        cfg.gossip.progress_interval = Duration::from_millis(50);
        cfg
    }

    #[test]
    fn test_populate_seals_history() {
        let store = MemoryStore::new();
        let params = SimParams {
            epochs: 2,
            events_per_epoch: 30,
            live_events: 5,
            ..SimParams::default()
        };
        let live = populate(&store, &params, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(live.len(), 5);
        assert_eq!(store.epoch(), 3);
        assert_eq!(store.event_count(), 90);
        assert_eq!(store.block_votes_progress(), 3);
        assert_eq!(store.epoch_packs_progress(), 3);
        assert_eq!(crate::store::PackStore::packs_num(&store, 3), 2);
    }

    #[test]
    fn test_params_validation() {
        assert!(SimParams::default().validate().is_ok());
        let params = SimParams {
            leechers: 0,
            ..SimParams::default()
        };
        assert!(params.validate().is_err());
        let params = SimParams {
            loss: 1.0,
            ..SimParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fresh_nodes_catch_up() {
        let params = SimParams {
            epochs: 2,
            events_per_epoch: 60,
            pack_size: 10,
            leechers: 2,
            live_events: 5,
            live_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(60),
            ..SimParams::default()
        };
        let report = run(&fast_config(), &params).await.unwrap();
        assert!(report.complete, "{:?}", report);
        assert_eq!(report.target.events, 2 * 60 + 60 + 5);
        for node in &report.nodes {
            assert_eq!(node.events, report.target.events);
            assert_eq!(node.epoch, 3);
        }
    }
}
