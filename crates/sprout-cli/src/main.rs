//! Command-line interface for the Sprout recovery pipeline.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sprout_core::config::env_vars;
use sprout_core::RecoveryConfig;

mod simulation;

use simulation::SimulationOptions;

/// Sprout - fault detection and self-recovery for garden automation devices.
#[derive(Parser, Debug)]
#[command(name = "sprout")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file. Environment variables override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a simulated garden that exercises error reporting and recovery.
    Simulate {
        /// Number of simulated devices.
        #[arg(short, long, default_value_t = 4)]
        devices: usize,
        /// How long to run.
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,
        /// Probability that a device faults on each tick, and that a recovery fails.
        #[arg(long, default_value_t = 0.2)]
        fail_rate: f64,
        /// Also route recoverable errors through the recovery manager.
        #[arg(long)]
        managed_recovery: bool,
        /// Persist device snapshots in a redb database instead of memory.
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Print the effective configuration as JSON.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Simulate {
            devices,
            duration_secs,
            fail_rate,
            managed_recovery,
            store,
        } => {
            let options = SimulationOptions {
                devices,
                duration_secs,
                fail_rate: fail_rate.clamp(0.0, 1.0),
                managed_recovery,
                store,
            };
            simulation::run(options, config).await
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    // JSON format for production/container environments
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose { "sprout=debug" } else { "sprout=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RecoveryConfig> {
    let config = match path {
        Some(path) => RecoveryConfig::from_json_file(path)?.with_env_overrides(),
        None => RecoveryConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}
