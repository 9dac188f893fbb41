//! CLI configuration module
//!
//! Combines the node configuration file with the simulation flags.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::cli::args::CliArgs;
use crate::config::Config;
use crate::sim::SimParams;

/// Everything a simulator run needs
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Per-node component configuration
    pub node: Config,
    pub sim: SimParams,
    pub verbose: bool,
    pub quiet: bool,
}

impl RunConfig {
    /// Create configuration from CLI arguments, reading the config file
    /// if one is given
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let node = match &args.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        Ok(Self::with_node_config(args, node))
    }

    /// Create configuration from CLI arguments and a node configuration
    pub fn with_node_config(args: &CliArgs, node: Config) -> Self {
        let sim = SimParams {
            epochs: args.epochs,
            events_per_epoch: args.events_per_epoch,
            parents: args.parents,
            pack_size: args.pack_size,
            leechers: args.leechers,
            live_events: args.live_events,
            loss: args.loss,
            timeout: Duration::from_secs(args.timeout),
            seed: args.seed,
            ..SimParams::default()
        };
        Self {
            node,
            sim,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.node.validate().context("Invalid node configuration")?;
        self.sim.validate().context("Invalid simulation flags")?;
        if self.sim.timeout == Duration::ZERO {
            return Err(anyhow::anyhow!("timeout must be at least 1 second"));
        }
        Ok(())
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
