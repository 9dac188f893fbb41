//! CLI module
//!
//! Command-line interface for the sync simulator.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::RunConfig;
