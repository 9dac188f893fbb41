//! dag-gossip-sync - Main entry point
//!
//! Runs an in-process sync simulation: a seeding node with a synthetic DAG
//! and fresh nodes catching up over a lossy in-memory network.

use anyhow::{Context, Result};
use dag_gossip_sync::{sim, CliArgs, RunConfig};
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("dag-gossip-sync starting");
    debug!("CLI arguments: {:?}", args);

    let config = RunConfig::from_args(&args).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    if !config.is_quiet() {
        display_run_info(&config);
    }

    let report = sim::run(&config.node, &config.sim).await.map_err(|e| {
        error!("Simulation failed: {:#}", e);
        e
    })?;

    if !config.is_quiet() {
        report.print();
    }
    if !report.complete {
        anyhow::bail!("nodes did not sync within {:?}", config.sim.timeout);
    }

    info!("dag-gossip-sync finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level {:?}", level);
}

/// Display the simulation setup
fn display_run_info(config: &RunConfig) {
    let sim = &config.sim;
    println!("Simulation:");
    println!("  Sealed epochs: {}", sim.epochs);
    println!("  Events per epoch: {}", sim.events_per_epoch);
    println!("  Pack size: {}", sim.pack_size);
    println!("  Fresh nodes: {}", sim.leechers);
    println!("  Live events: {}", sim.live_events);
    println!("  Message loss: {:.1}%", sim.loss * 100.0);
    println!("  Timeout: {:?}", sim.timeout);
    println!();
    println!("Configuration:");
    println!(
        "  Leecher: recheck {:?}, {} parallel chunks of up to {} items",
        config.node.leecher.recheck_interval,
        config.node.leecher.session.parallel_chunks_download,
        config.node.leecher.session.default_chunk_items_num
    );
    println!(
        "  Seeder: {} sender tasks, {} queued requests",
        config.node.seeder.sender_threads, config.node.seeder.max_sender_tasks
    );
    println!("  Heavy check: {} threads", config.node.heavy_check.threads);
    println!();
}
