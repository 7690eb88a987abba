//! Pipeline configuration
//!
//! Defines every tunable of a pipeline run: where the definitions live,
//! gate thresholds, stage timeouts and probe retry settings. The library
//! never reads the environment; the CLI maps its flags onto this struct.

use keel_core::domain::lint::LintLevel;
use keel_core::domain::probe::ProbeSpec;
use keel_core::domain::run::{RunMode, Stage};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Pipeline configuration
///
/// All timeouts and retry settings are configurable to allow tuning
/// for different labs (a laptop vs a slow CI worker).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Site definition file (roles, plays, probes)
    pub site_path: PathBuf,

    /// Inventory definition file (nodes, groups, variables)
    pub inventory_path: PathBuf,

    pub mode: RunMode,

    /// Lint violations at or above this level fail the quality gate
    pub lint_min_level: LintLevel,

    /// Maximum number of artifacts allowed to carry a CRITICAL finding
    pub critical_artifact_threshold: usize,

    /// When false the Scan stage is recorded as skipped
    pub scan_enabled: bool,

    /// Scanner executable
    pub scanner_binary: String,

    /// Directory handed to the scanner; defaults to the site directory
    pub scan_target: Option<PathBuf>,

    /// Max nodes converged at the same time
    pub max_parallel_nodes: usize,

    pub timeouts: StageTimeouts,

    /// Probes added on top of the ones the site declares
    pub probes: Vec<ProbeSpec>,

    /// Tries per probe; 1 means no retry
    pub probe_attempts: u32,

    /// Delay before the first retry, doubled after each failure
    pub probe_backoff: Duration,

    /// Cap for the retry delay
    pub probe_max_backoff: Duration,

    /// Per-request timeout
    pub probe_timeout: Duration,

    /// Extra variables (`--var key=value`), highest precedence
    pub extra_vars: BTreeMap<String, String>,
}

/// Time budget of each stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub lint: Duration,
    pub scan: Duration,
    pub converge: Duration,
    pub verify: Duration,
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Lint => self.lint,
            Stage::Scan => self.scan,
            Stage::Converge => self.converge,
            Stage::Verify => self.verify,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            lint: Duration::from_secs(60),
            scan: Duration::from_secs(300),
            converge: Duration::from_secs(1800), // 30 minutes
            verify: Duration::from_secs(120),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with defaults
    pub fn new(site_path: impl Into<PathBuf>, inventory_path: impl Into<PathBuf>) -> Self {
        Self {
            site_path: site_path.into(),
            inventory_path: inventory_path.into(),
            mode: RunMode::Full,
            lint_min_level: LintLevel::Warning,
            critical_artifact_threshold: 2,
            scan_enabled: true,
            scanner_binary: "trivy".to_string(),
            scan_target: None,
            max_parallel_nodes: 4,
            timeouts: StageTimeouts::default(),
            probes: Vec::new(),
            probe_attempts: 1,
            probe_backoff: Duration::from_millis(500),
            probe_max_backoff: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            extra_vars: BTreeMap::new(),
        }
    }

    /// Adds an extra variable
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_vars.insert(key.into(), value.into());
        self
    }

    /// Adds a probe on top of the site's
    pub fn with_probe(mut self, probe: ProbeSpec) -> Self {
        self.probes.push(probe);
        self
    }

    /// Directory containing the site file; templates are read below it
    pub fn site_dir(&self) -> PathBuf {
        match self.site_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Directory the scanner is pointed at
    pub fn scan_dir(&self) -> PathBuf {
        self.scan_target.clone().unwrap_or_else(|| self.site_dir())
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.site_path.as_os_str().is_empty() {
            anyhow::bail!("site path cannot be empty");
        }

        if self.inventory_path.as_os_str().is_empty() {
            anyhow::bail!("inventory path cannot be empty");
        }

        if self.scan_enabled && self.scanner_binary.trim().is_empty() {
            anyhow::bail!("scanner_binary cannot be empty when scanning is enabled");
        }

        if self.max_parallel_nodes == 0 {
            anyhow::bail!("max_parallel_nodes must be greater than 0");
        }

        for stage in Stage::ALL {
            if self.timeouts.for_stage(stage).is_zero() {
                anyhow::bail!("{} timeout must be greater than 0", stage);
            }
        }

        if self.probe_attempts == 0 {
            anyhow::bail!("probe_attempts must be at least 1");
        }

        if self.probe_timeout.is_zero() {
            anyhow::bail!("probe_timeout must be greater than 0");
        }

        if self.probe_max_backoff < self.probe_backoff {
            anyhow::bail!("probe_max_backoff must not be smaller than probe_backoff");
        }

        for probe in &self.probes {
            if !probe.url.starts_with("http://") && !probe.url.starts_with("https://") {
                anyhow::bail!("probe url '{}' must start with http:// or https://", probe.url);
            }
        }

        for key in self.extra_vars.keys() {
            if key.is_empty() {
                anyhow::bail!("extra variable names cannot be empty");
            }
        }

        Ok(())
    }
}
