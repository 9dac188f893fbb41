//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the sync simulator
#[derive(Debug, Parser)]
#[command(name = "dag-gossip-sync")]
#[command(about = "Simulates DAG gossip sync of fresh nodes against a seeding node", long_about = None)]
pub struct CliArgs {
    /// JSON configuration file; missing fields take their defaults
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Sealed epochs held by the seeder
    #[arg(long, default_value_t = 3)]
    pub epochs: u32,

    /// Events generated per epoch
    #[arg(long, default_value_t = 200)]
    pub events_per_epoch: usize,

    /// Maximum parents per generated event
    #[arg(long, default_value_t = 3)]
    pub parents: usize,

    /// Events per pack of the open epoch
    #[arg(long, default_value_t = 20)]
    pub pack_size: usize,

    /// Number of fresh nodes
    #[arg(short, long, default_value_t = 2)]
    pub leechers: usize,

    /// Events emitted by the seeder during the run
    #[arg(long, default_value_t = 0)]
    pub live_events: usize,

    /// Message loss probability (0.0 - 1.0)
    #[arg(long, default_value_t = 0.0)]
    pub loss: f64,

    /// Give up after this many seconds
    #[arg(short, long, default_value_t = 60)]
    pub timeout: u64,

    /// Random seed of the generated DAG and the network
    #[arg(short, long, default_value_t = 1)]
    pub seed: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["dag-gossip-sync"]).unwrap();
        assert!(args.config.is_none());
        assert_eq!(args.epochs, 3);
        assert_eq!(args.events_per_epoch, 200);
        assert_eq!(args.leechers, 2);
        assert_eq!(args.loss, 0.0);
        assert_eq!(args.timeout, 60);
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_overrides() {
        let args = CliArgs::try_parse_from([
            "dag-gossip-sync",
            "--config",
            "node.json",
            "--epochs",
            "5",
            "-l",
            "4",
            "--loss",
            "0.1",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("node.json")));
        assert_eq!(args.epochs, 5);
        assert_eq!(args.leechers, 4);
        assert_eq!(args.loss, 0.1);
        assert!(args.is_verbose());
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }
}
