//! Run reporting
//!
//! Reporters receive the finished `PipelineRun` exactly once, whether the
//! run reached `Done` or `Failed`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::domain::run::PipelineRun;
use std::path::PathBuf;
use tracing::info;

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, run: &PipelineRun) -> Result<()>;
}

/// Writes the run as pretty-printed JSON
pub struct JsonFileReporter {
    path: PathBuf,
}

impl JsonFileReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Reporter for JsonFileReporter {
    async fn report(&self, run: &PipelineRun) -> Result<()> {
        let json = serde_json::to_string_pretty(run).context("Failed to serialize run report")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write report to {}", self.path.display()))?;

        info!("Run report written to {}", self.path.display());
        Ok(())
    }
}

/// Emits a one-line summary through tracing
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn report(&self, run: &PipelineRun) -> Result<()> {
        match &run.failure {
            None => info!(
                run_id = %run.id,
                "Run {} finished: {} node(s), {} probe(s)",
                run.site,
                run.nodes.len(),
                run.probes.len()
            ),
            Some(failure) => info!(
                run_id = %run.id,
                "Run {} failed ({}): {}",
                run.site,
                failure.kind,
                failure.message
            ),
        }
        Ok(())
    }
}
