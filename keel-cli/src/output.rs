//! Console output
//!
//! Human-readable run summary, printed once the pipeline reaches a terminal
//! state.

use anyhow::Result;
use async_trait::async_trait;
use colored::*;
use keel_core::domain::lint::{LintLevel, Violation};
use keel_core::domain::run::{PipelineRun, StageOutcome, StageStatus};
use keel_runner::Reporter;

pub struct ConsoleReporter;

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn report(&self, run: &PipelineRun) -> Result<()> {
        print_run(run);
        Ok(())
    }
}

fn print_run(run: &PipelineRun) {
    println!();
    println!("{} {}", "Run".bold(), run.id.to_string().dimmed());
    println!("  Site:     {}", run.site.bold());
    println!(
        "  Started:  {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    let duration = run.completed_at.signed_duration_since(run.started_at);
    println!("  Duration: {}ms", duration.num_milliseconds());

    println!("\n{}", "Stages:".bold());
    for outcome in &run.stages {
        print_stage(outcome);
    }

    if !run.violations.is_empty() {
        println!("\n{}", "Violations:".bold());
        for violation in &run.violations {
            print_violation(violation);
        }
    }

    if let Some(policy) = &run.policy {
        println!("\n{}", "Policy:".bold());
        println!(
            "  {} finding(s), {} critical artifact(s), threshold {}",
            policy.findings.len(),
            policy.critical_artifacts.len(),
            policy.threshold
        );
        for artifact in &policy.critical_artifacts {
            println!("    {} {}", "▸".red(), artifact);
        }
    }

    if !run.nodes.is_empty() {
        println!("\n{}", "Nodes:".bold());
        for node in &run.nodes {
            let mark = if node.succeeded() {
                "✓".green()
            } else {
                "✗".red()
            };
            println!(
                "  {} {:<12} changed={} ok={}",
                mark,
                node.node,
                node.changed().to_string().yellow(),
                node.unchanged().to_string().green()
            );
            if !node.handlers.is_empty() {
                println!("      handlers: {}", node.handlers.join(", ").dimmed());
            }
            if let Some(error) = &node.error {
                println!("      {}", error.red());
            }
        }
    }

    if !run.probes.is_empty() {
        println!("\n{}", "Probes:".bold());
        for probe in &run.probes {
            let mark = if probe.success {
                "✓".green()
            } else {
                "✗".red()
            };
            let status = probe
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} {} [{}] attempts={}",
                mark, probe.probe, status, probe.attempts
            );
            if let Some(detail) = &probe.detail {
                println!("      {}", detail.dimmed());
            }
        }
    }

    println!();
    match &run.failure {
        None => println!("{}", "✓ Pipeline succeeded".green().bold()),
        Some(failure) => {
            println!(
                "{}",
                format!("✗ Pipeline failed: {}", failure.kind).red().bold()
            );
            println!("  {}", failure.message);
            println!("  Exit code: {}", failure.exit_code);
        }
    }
}

fn print_stage(outcome: &StageOutcome) {
    let status = match outcome.status {
        StageStatus::Succeeded => "succeeded".green(),
        StageStatus::Failed => "failed".red().bold(),
        StageStatus::Skipped => "skipped".dimmed(),
    };
    let duration = outcome
        .duration_ms
        .map(|ms| format!(" ({}ms)", ms))
        .unwrap_or_default();
    println!(
        "  {} {:<9} {}{}",
        "▸".cyan(),
        outcome.stage.to_string(),
        status,
        duration.dimmed()
    );
    if let Some(message) = &outcome.message {
        println!("      {}", message.dimmed());
    }
}

fn print_violation(violation: &Violation) {
    let level = match violation.level {
        LintLevel::Error => "error".red(),
        LintLevel::Warning => "warning".yellow(),
        LintLevel::Info => "info".dimmed(),
    };
    println!(
        "  {:<7} {} {}: {}",
        level,
        violation.rule.cyan(),
        violation.location.dimmed(),
        violation.message
    );
}
