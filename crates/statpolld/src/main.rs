//! statpolld - cluster statistics collector daemon.
//!
//! Periodically polls a set of storage clusters for named statistics,
//! computes derived statistics from the results, and forwards everything to
//! a configurable stats processor (InfluxDB, stdout).

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod config;
mod sinks;

use std::sync::atomic::Ordering;

use clap::Parser;
use statpoll_core::daemon::Daemon;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Cluster statistics collector daemon.
#[derive(Parser)]
#[command(name = "statpolld", about = "Cluster statistics collector daemon", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "./statpolld.toml")]
    config: String,

    /// Stats processor to use, overriding the config file.
    #[arg(short = 'x', long)]
    processor: Option<String>,

    /// Space-separated args passed to the stats processor's start function,
    /// overriding the config file.
    #[arg(short = 'a', long)]
    processor_args: Option<String>,

    /// Re-raise unexpected per-cluster errors instead of skipping the
    /// cluster. They are most likely bugs.
    #[arg(long)]
    debug: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for directive in [
        format!("statpolld={}", level),
        format!("statpoll_core={}", level),
    ] {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("bad log directive: {}", e),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Logs the configured stat sets so the operator can verify the
/// configuration before the first tick.
fn print_stat_groups(daemon: &Daemon) {
    for (interval, stat_set) in daemon.stat_sets() {
        for (cluster, work) in stat_set.iter() {
            info!(
                "configured stat set: cluster: {}, update interval: {}s, stat keys: {:?}",
                cluster,
                interval.as_secs(),
                work.stats
            );
        }
    }
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!("statpolld {} starting", env!("CARGO_PKG_VERSION"));

    let file = match config::load_file(&args.config) {
        Ok(file) => file,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let mut daemon = Daemon::new();
    if let Err(e) = config::configure(
        &mut daemon,
        &file,
        args.processor.as_deref(),
        args.processor_args.as_deref(),
    ) {
        error!("configuration failed: {}", e);
        std::process::exit(1);
    }

    print_stat_groups(&daemon);

    let running = daemon.shutdown_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        running.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to set Ctrl-C handler: {}", e);
    }

    if let Err(e) = daemon.run(args.debug) {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("shutdown complete");
}
