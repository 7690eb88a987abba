//! Configuration module
//!
//! Maps command-line flags (with their `KEEL_*` environment fallbacks) onto
//! the runner's `PipelineConfig`.

use anyhow::Result;
use clap::Args;
use keel_core::domain::lint::LintLevel;
use keel_core::domain::probe::ProbeSpec;
use keel_core::domain::run::RunMode;
use keel_runner::{PipelineConfig, StageTimeouts};
use std::path::PathBuf;
use std::time::Duration;

/// Where the definitions live
#[derive(Args, Debug, Clone)]
pub struct DefinitionArgs {
    /// Site definition (roles, plays, probes)
    #[arg(short, long, env = "KEEL_SITE", default_value = "site.lua")]
    pub site: PathBuf,

    /// Inventory definition (nodes, groups, variables)
    #[arg(short, long, env = "KEEL_INVENTORY", default_value = "inventory.lua")]
    pub inventory: PathBuf,

    /// Extra variables as key=value pairs, highest precedence
    #[arg(long = "var", value_parser = parse_key_val)]
    pub vars: Vec<(String, String)>,
}

impl DefinitionArgs {
    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(&self.site, &self.inventory);
        for (key, value) in &self.vars {
            config = config.with_var(key.clone(), value.clone());
        }
        config
    }
}

/// Quality gate settings shared by `run` and `check`
#[derive(Args, Debug, Clone)]
pub struct GateArgs {
    /// Lint violations at or above this level fail the run (info, warning, error)
    #[arg(long, env = "KEEL_LINT_LEVEL", default_value = "warning")]
    pub lint_level: LintLevel,

    /// Write the run report as JSON to this file
    #[arg(long, env = "KEEL_REPORT")]
    pub report: Option<PathBuf>,

    /// Lint stage budget in seconds
    #[arg(long, default_value = "60")]
    pub lint_timeout: u64,
}

/// Settings only meaningful for a full run
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Max number of artifacts allowed to carry CRITICAL findings
    #[arg(long, env = "KEEL_CRITICAL_THRESHOLD", default_value = "2")]
    pub critical_threshold: usize,

    /// Skip the policy gate
    #[arg(long)]
    pub no_scan: bool,

    /// Scanner executable
    #[arg(long, env = "KEEL_SCANNER", default_value = "trivy")]
    pub scanner: String,

    /// Directory to scan (defaults to the site directory)
    #[arg(long)]
    pub scan_dir: Option<PathBuf>,

    /// Max nodes converged in parallel
    #[arg(long, env = "KEEL_PARALLEL", default_value = "4")]
    pub parallel: usize,

    /// Extra health probe URL (repeatable)
    #[arg(long = "probe")]
    pub probes: Vec<String>,

    /// Attempts per probe
    #[arg(long, env = "KEEL_PROBE_ATTEMPTS", default_value = "1")]
    pub probe_attempts: u32,

    /// Per-request probe timeout in seconds
    #[arg(long, default_value = "5")]
    pub probe_timeout: u64,

    /// Delay before the first probe retry, in milliseconds
    #[arg(long, default_value = "500")]
    pub probe_backoff: u64,

    /// Cap on the delay between probe retries, in milliseconds
    #[arg(long, default_value = "10000")]
    pub probe_max_backoff: u64,

    /// Scan stage budget in seconds
    #[arg(long, default_value = "300")]
    pub scan_timeout: u64,

    /// Converge stage budget in seconds
    #[arg(long, env = "KEEL_CONVERGE_TIMEOUT", default_value = "1800")]
    pub converge_timeout: u64,

    /// Verify stage budget in seconds
    #[arg(long, default_value = "120")]
    pub verify_timeout: u64,
}

/// Builds the configuration of a syntax-check run
pub fn check_config(defs: &DefinitionArgs, gate: &GateArgs) -> Result<PipelineConfig> {
    let mut config = defs.pipeline_config();
    config.mode = RunMode::SyntaxCheck;
    config.lint_min_level = gate.lint_level;
    config.scan_enabled = false;
    config.timeouts.lint = Duration::from_secs(gate.lint_timeout);
    config.validate()?;
    Ok(config)
}

/// Builds the configuration of a full run
pub fn run_config(defs: &DefinitionArgs, gate: &GateArgs, run: &RunArgs) -> Result<PipelineConfig> {
    let mut config = defs.pipeline_config();
    config.lint_min_level = gate.lint_level;
    config.critical_artifact_threshold = run.critical_threshold;
    config.scan_enabled = !run.no_scan;
    config.scanner_binary = run.scanner.clone();
    config.scan_target = run.scan_dir.clone();
    config.max_parallel_nodes = run.parallel;
    config.probe_attempts = run.probe_attempts;
    config.probe_timeout = Duration::from_secs(run.probe_timeout);
    config.probe_backoff = Duration::from_millis(run.probe_backoff);
    config.probe_max_backoff = Duration::from_millis(run.probe_max_backoff);
    config.timeouts = StageTimeouts {
        lint: Duration::from_secs(gate.lint_timeout),
        scan: Duration::from_secs(run.scan_timeout),
        converge: Duration::from_secs(run.converge_timeout),
        verify: Duration::from_secs(run.verify_timeout),
    };
    for url in &run.probes {
        config = config.with_probe(ProbeSpec::new(url.clone()));
    }
    config.validate()?;
    Ok(config)
}

/// Parse a single key=value pair
fn parse_key_val(s: &str) -> Result<(String, String)> {
    let pos = s
        .find('=')
        .ok_or_else(|| anyhow::anyhow!("invalid KEY=value: no `=` found in `{}`", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("greeting=hi=there").unwrap(),
            ("greeting".to_string(), "hi=there".to_string())
        );
        assert!(parse_key_val("greeting").is_err());
    }

    #[test]
    fn test_run_config_maps_flags() {
        let defs = DefinitionArgs {
            site: "lab/site.lua".into(),
            inventory: "lab/inventory.lua".into(),
            vars: vec![("greeting".into(), "hi".into())],
        };
        let gate = GateArgs {
            lint_level: LintLevel::Error,
            report: None,
            lint_timeout: 30,
        };
        let run = RunArgs {
            critical_threshold: 0,
            no_scan: false,
            scanner: "trivy".into(),
            scan_dir: None,
            parallel: 8,
            probes: vec!["http://localhost:8080/".into()],
            probe_attempts: 3,
            probe_timeout: 2,
            probe_backoff: 250,
            probe_max_backoff: 4000,
            scan_timeout: 60,
            converge_timeout: 600,
            verify_timeout: 30,
        };

        let config = run_config(&defs, &gate, &run).unwrap();
        assert_eq!(config.mode, RunMode::Full);
        assert_eq!(config.critical_artifact_threshold, 0);
        assert_eq!(config.extra_vars["greeting"], "hi");
        assert_eq!(config.probes.len(), 1);
        assert_eq!(config.timeouts.converge, Duration::from_secs(600));
        assert_eq!(config.timeouts.lint, Duration::from_secs(30));
        assert_eq!(config.probe_backoff, Duration::from_millis(250));
        assert_eq!(config.probe_max_backoff, Duration::from_secs(4));
    }

    #[test]
    fn test_check_config_disables_scan() {
        let defs = DefinitionArgs {
            site: "site.lua".into(),
            inventory: "inventory.lua".into(),
            vars: vec![],
        };
        let gate = GateArgs {
            lint_level: LintLevel::Info,
            report: None,
            lint_timeout: 5,
        };

        let config = check_config(&defs, &gate).unwrap();
        assert_eq!(config.mode, RunMode::SyntaxCheck);
        assert!(!config.scan_enabled);
        assert_eq!(config.timeouts.lint, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_probe_url_rejected() {
        let defs = DefinitionArgs {
            site: "site.lua".into(),
            inventory: "inventory.lua".into(),
            vars: vec![],
        };
        let gate = GateArgs {
            lint_level: LintLevel::Warning,
            report: None,
            lint_timeout: 60,
        };
        let run = RunArgs {
            critical_threshold: 2,
            no_scan: true,
            scanner: "trivy".into(),
            scan_dir: None,
            parallel: 4,
            probes: vec!["localhost:8080".into()],
            probe_attempts: 1,
            probe_timeout: 5,
            probe_backoff: 500,
            probe_max_backoff: 10000,
            scan_timeout: 300,
            converge_timeout: 1800,
            verify_timeout: 120,
        };
        assert!(run_config(&defs, &gate, &run).is_err());
    }
}
