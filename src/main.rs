use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use remote_lab_coordinator::build_coordinator;
use remote_lab_coordinator::domain::clock::WallClock;

/// Runs the reservation coordinator of one deployment: loads the
/// deployment configuration and drives the scheduling workers.
#[derive(Debug, Parser)]
#[command(name = "remote_lab_coordinator")]
struct Args {
    /// Path to the deployment configuration JSON.
    #[arg(short, long)]
    config: String,

    /// Number of concurrent scheduler worker threads.
    #[arg(short, long, default_value_t = 2)]
    workers: usize,

    /// Milliseconds each worker sleeps between scheduling passes.
    #[arg(long, default_value_t = 250)]
    tick_interval_ms: u64,

    /// How long to run before shutting the workers down. 0 runs forever.
    #[arg(long, default_value_t = 0)]
    run_seconds: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let coordinator =
        build_coordinator(&args.config, WallClock::shared()).with_context(|| format!("loading deployment from '{}'", args.config))?;

    let pool = coordinator.spawn_workers(args.workers, Duration::from_millis(args.tick_interval_ms));
    log::info!("{} scheduler workers running for '{}'.", args.workers, coordinator.deployment_url());

    if args.run_seconds == 0 {
        loop {
            thread::park();
        }
    }

    thread::sleep(Duration::from_secs(args.run_seconds));
    pool.stop();
    log::info!("Coordinator shut down.");

    Ok(())
}
