use btb_cluster_core::config::ControllerConfig;
use btb_cluster_core::fit::{Controller, StepOutcome};
use clap::Parser;
use log::info;
use std::path::PathBuf;

/// Advance the adaptive Metropolis chain by one step: consume the waiting
/// scenario ensemble, decide acceptance and propose the next parameters.
#[derive(Parser)]
#[command(name = "btb-fit", version, about)]
struct Args {
    /// Controller configuration file
    #[arg(short, long)]
    config: PathBuf,
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    btb_cluster_cli::init_logging(&args.level)?;

    let config = ControllerConfig::load(&args.config)?;
    match Controller::new(&config).step()? {
        StepOutcome::Initialised => info!(
            "chain initialised, first parameters written to {}",
            config.parameters_file.display()
        ),
        StepOutcome::Advanced { accepted } => info!(
            "step {}: next parameters written to {}",
            if accepted { "accepted" } else { "rejected" },
            config.parameters_file.display()
        ),
    }
    Ok(())
}
