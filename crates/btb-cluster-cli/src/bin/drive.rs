use anyhow::Context;
use btb_cluster_core::config::{ControllerConfig, Parameters, ScenarioConfig};
use btb_cluster_core::fit::Controller;
use btb_cluster_core::scenario::{Scenario, ScenarioResults};
use clap::Parser;
use log::info;
use rayon::prelude::*;
use std::fs;
use std::path::PathBuf;

/// Convenience driver: alternate controller passes with in-process scenario
/// ensembles. Each scenario stays an independent task with its own generator
/// and result file, exactly as when launched as separate processes.
#[derive(Parser)]
#[command(name = "btb-drive", version, about)]
struct Args {
    /// Controller configuration file
    #[arg(short, long)]
    config: PathBuf,
    /// Scenario configuration file
    #[arg(short, long)]
    scenario_config: PathBuf,
    /// Metropolis iterations to run
    #[arg(short = 'n', long, default_value_t = 10)]
    iterations: u32,
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    btb_cluster_cli::init_logging(&args.level)?;

    let controller_config = ControllerConfig::load(&args.config)?;
    let scenario_config = ScenarioConfig::load(&args.scenario_config)?;
    fs::create_dir_all(&controller_config.results_dir).with_context(|| {
        format!(
            "creating results directory {}",
            controller_config.results_dir.display()
        )
    })?;

    for iteration in 0..args.iterations {
        Controller::new(&controller_config).step()?;

        let params = Parameters::load(&controller_config.parameters_file)?;
        let base_seed = params.rng_seed.unwrap_or_default();
        (0..controller_config.num_scenarios)
            .into_par_iter()
            .try_for_each(|id| -> anyhow::Result<()> {
                let seed = base_seed.wrapping_add(id as u64);
                let mut scenario = Scenario::new(&scenario_config, &params, seed)?;
                let results = scenario.run();
                let path = controller_config
                    .results_dir
                    .join(ScenarioResults::file_name(id));
                results
                    .write(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
                Ok(())
            })?;
        info!(
            "iteration {iteration}: ensemble of {} scenarios finished",
            controller_config.num_scenarios
        );
    }

    // Consume the final ensemble so its row reaches the output file.
    Controller::new(&controller_config).step()?;
    Ok(())
}
