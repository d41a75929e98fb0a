//! fedclust-sim - descriptor-clustering simulation driver
//!
//! Usage:
//! ```bash
//! fedclust-sim --config sim.yaml
//! fedclust-sim --config sim.yaml --find-optimal --skip-training
//! fedclust-sim --config sim.yaml --timings timings.json --log-level debug
//! ```

mod sim;
mod trainer;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use fedclust_common::{init_logging, LogLevel, SimulationConfig};
use tracing::info;

use crate::sim::{SimOptions, Simulation};

/// Simulates Encoding clients and clusters their class descriptors
#[derive(Parser, Debug)]
#[command(name = "fedclust-sim")]
#[command(author, version)]
#[command(about = "Cluster federated clients by their per-class descriptors")]
struct Args {
    /// Simulation plan (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Report the silhouette-optimal number of clusters every round
    #[arg(long)]
    find_optimal: bool,

    /// Only run descriptor rounds
    #[arg(long)]
    skip_training: bool,

    /// Seed override for data, encoder and clients
    #[arg(long)]
    seed: Option<u64>,

    /// Write per-client timings as JSON to this file
    #[arg(long)]
    timings: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = SimulationConfig::from_yaml_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    info!("Loaded simulation plan from {}", args.config.display());

    let options = SimOptions {
        find_optimal: args.find_optimal,
        skip_training: args.skip_training,
        seed: args.seed,
    };
    let mut simulation = Simulation::new(config, options)?;
    let report = simulation.run()?;

    print!("{}", report.cluster_report);
    for round in &report.rounds {
        let mut line = format!("Round {}: ARI {:.4}", round.round, round.ari);
        if let Some(optimal) = round.optimal_clusters {
            line.push_str(&format!(", optimal clusters {optimal}"));
        }
        if let Some(accuracy) = round.mean_accuracy {
            line.push_str(&format!(", accuracy {accuracy:.4}"));
        }
        println!("{line}");
    }
    println!("{}", report.timings());

    if let Some(path) = &args.timings {
        let json = report.ledger.export_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Timings written to {}", path.display());
    }
    Ok(())
}
