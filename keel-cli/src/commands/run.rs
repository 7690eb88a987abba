//! Run and check command handlers
//!
//! Both build a `PipelineDriver` from the command-line configuration and
//! return the run's exit status.

use anyhow::Result;
use keel_runner::{JsonFileReporter, PipelineConfig, PipelineDriver};
use tracing::info;

use crate::config::{DefinitionArgs, GateArgs, RunArgs, check_config, run_config};
use crate::output::ConsoleReporter;

/// Runs the full gated pipeline
pub async fn handle_run(defs: DefinitionArgs, gate: GateArgs, run: RunArgs) -> Result<i32> {
    let config = run_config(&defs, &gate, &run)?;
    execute(config, &gate).await
}

/// Runs Init + Lint only
pub async fn handle_check(defs: DefinitionArgs, gate: GateArgs) -> Result<i32> {
    let config = check_config(&defs, &gate)?;
    execute(config, &gate).await
}

async fn execute(config: PipelineConfig, gate: &GateArgs) -> Result<i32> {
    info!(
        "Using site {} and inventory {}",
        config.site_path.display(),
        config.inventory_path.display()
    );

    let mut driver = PipelineDriver::standard(config)?.with_reporter(Box::new(ConsoleReporter));
    if let Some(path) = &gate.report {
        driver = driver.with_reporter(Box::new(JsonFileReporter::new(path)));
    }

    let run = driver.run().await;
    Ok(run.exit_code())
}
