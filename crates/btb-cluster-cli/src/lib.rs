//! Shared plumbing for the bTB cluster command-line tools.

use anyhow::Context;

/// Initialise env_logger at the level given on the command line.
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = level
        .parse::<log::LevelFilter>()
        .with_context(|| format!("unrecognised log level {level:?}"))?;
    env_logger::Builder::new()
        .filter_level(filter)
        .try_init()
        .context("logger already initialised")?;
    Ok(())
}
