use anyhow::Context;
use btb_cluster_core::config::{Parameters, ScenarioConfig};
use btb_cluster_core::scenario::{Scenario, ScenarioResults};
use clap::Parser;
use log::info;
use std::path::PathBuf;

/// Run one stochastic outbreak scenario and write `scenario_<id>.results`
/// into the working directory.
#[derive(Parser)]
#[command(name = "btb-scenario", version, about)]
struct Args {
    /// Scenario configuration file
    #[arg(short, long)]
    config: PathBuf,
    /// Parameters file written by the fitting controller
    #[arg(short, long)]
    params: PathBuf,
    /// Scenario id within the ensemble
    #[arg(short, long, default_value_t = 0)]
    id: usize,
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    btb_cluster_cli::init_logging(&args.level)?;

    let config = ScenarioConfig::load(&args.config)?;
    let params = Parameters::load(&args.params)?;
    let seed = params
        .rng_seed
        .unwrap_or_default()
        .wrapping_add(args.id as u64);

    let mut scenario = Scenario::new(&config, &params, seed)?;
    let results = scenario.run();

    let output = PathBuf::from(ScenarioResults::file_name(args.id));
    results
        .write(&output)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(
        "scenario {} finished: log-likelihood {}, {} reactors, {} breakdowns",
        args.id, results.loglikelihood, results.num_reactors, results.num_breakdowns
    );
    Ok(())
}
