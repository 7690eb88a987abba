//! Pipeline driver
//!
//! Sequences the gated stages `Lint → Scan → Converge → Verify`. Each stage
//! runs under its own time budget; the first failing stage moves the run to
//! `Failed` and the remaining stages are recorded as skipped. Reporters are
//! invoked exactly once at the end, whatever the terminal state.

use chrono::Utc;
use keel_core::PipelineError;
use keel_core::ResourceApplyError;
use keel_core::domain::lint::Violation;
use keel_core::domain::probe::ProbeResult;
use keel_core::domain::run::{
    NodeReport, PipelineRun, PipelineState, PolicySummary, RunFailure, RunMode, Stage,
    StageOutcome, StageStatus,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::connection::{Connector, ContainerConnector};
use crate::context::RunContext;
use crate::convergence::ConvergenceEngine;
use crate::definitions::Definitions;
use crate::inventory::{ResolvedInventory, resolve};
use crate::lint::QualityGate;
use crate::plan::NodePlan;
use crate::policy::{self, Scanner, TrivyScanner};
use crate::probe::{self, HttpProber, Prober, RetryPolicy};
use crate::report::Reporter;
use crate::template::{PlaceholderRenderer, TemplateRenderer};

/// How a stage ended when it did not fail
enum StageEnd {
    Succeeded(String),
    Skipped(String),
}

/// Mutable record of a run in progress
struct RunRecord {
    id: Uuid,
    site: String,
    mode: RunMode,
    started_at: chrono::DateTime<Utc>,
    stages: Vec<StageOutcome>,
    failure: Option<RunFailure>,
    violations: Vec<Violation>,
    policy: Option<PolicySummary>,
    nodes: Vec<NodeReport>,
    probes: Vec<ProbeResult>,
}

impl RunRecord {
    fn new(id: Uuid, site: String, mode: RunMode) -> Self {
        Self {
            id,
            site,
            mode,
            started_at: Utc::now(),
            stages: Vec::new(),
            failure: None,
            violations: Vec::new(),
            policy: None,
            nodes: Vec::new(),
            probes: Vec::new(),
        }
    }

    fn fail(&mut self, error: &PipelineError) {
        self.failure = Some(RunFailure {
            stage: error.stage(),
            kind: error.kind(),
            message: error.to_string(),
            exit_code: error.exit_code(),
        });
    }

    fn skip_remaining(&mut self, reason: &str) {
        for stage in Stage::ALL {
            if !self.stages.iter().any(|o| o.stage == stage) {
                self.stages.push(StageOutcome::skipped(stage, reason));
            }
        }
    }

    fn finish(self, ctx: &RunContext) -> PipelineRun {
        let state = if self.failure.is_some() {
            PipelineState::Failed
        } else {
            PipelineState::Done
        };
        PipelineRun {
            id: self.id,
            site: self.site,
            mode: self.mode,
            started_at: self.started_at,
            completed_at: Utc::now(),
            state,
            stages: self.stages,
            failure: self.failure,
            violations: self.violations,
            policy: self.policy,
            nodes: self.nodes,
            probes: self.probes,
            logs: ctx.drain_logs(),
        }
    }
}

/// Runs the gated pipeline against injected collaborators
pub struct PipelineDriver {
    config: PipelineConfig,
    connector: Arc<dyn Connector>,
    scanner: Arc<dyn Scanner>,
    prober: Arc<dyn Prober>,
    renderer: Arc<dyn TemplateRenderer>,
    reporters: Vec<Box<dyn Reporter>>,
}

impl PipelineDriver {
    pub fn new(
        config: PipelineConfig,
        connector: Arc<dyn Connector>,
        scanner: Arc<dyn Scanner>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            config,
            connector,
            scanner,
            prober,
            renderer: Arc::new(PlaceholderRenderer),
            reporters: Vec::new(),
        }
    }

    /// Driver with the container, Trivy and HTTP collaborators
    pub fn standard(config: PipelineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let scanner = Arc::new(TrivyScanner::new(config.scanner_binary.clone()));
        let prober = Arc::new(HttpProber::new(config.probe_timeout)?);
        Ok(Self::new(config, Arc::new(ContainerConnector), scanner, prober))
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Loads the definitions named by the configuration and runs them
    pub async fn run(&self) -> PipelineRun {
        let loaded = Definitions::load(&self.config);
        self.execute(loaded).await
    }

    /// Runs already-loaded definitions
    pub async fn run_definitions(&self, defs: Definitions) -> PipelineRun {
        self.execute(Ok(defs)).await
    }

    async fn execute(&self, loaded: Result<Definitions, PipelineError>) -> PipelineRun {
        let ctx = RunContext::new(Uuid::new_v4());
        let site_name = match &loaded {
            Ok(defs) => defs.site.name.clone(),
            Err(_) => self.config.site_path.display().to_string(),
        };
        let mut record = RunRecord::new(ctx.run_id, site_name, self.config.mode);

        ctx.log_info(format!(
            "Starting {} run {} of '{}'",
            match self.config.mode {
                RunMode::Full => "full",
                RunMode::SyntaxCheck => "syntax-check",
            },
            ctx.run_id,
            record.site
        ));

        let prepared = loaded.and_then(|defs| {
            let resolved = resolve(&defs.inventory, &defs.site, &self.config.extra_vars)?;
            Ok((defs, resolved))
        });

        match prepared {
            Ok((defs, resolved)) => {
                ctx.log_info(format!("Resolved {} node(s)", resolved.nodes.len()));
                self.run_stages(&defs, &resolved, &mut record, &ctx).await;
            }
            Err(e) => {
                ctx.log_error(e.to_string());
                record.fail(&e);
                record.skip_remaining("configuration error");
            }
        }

        let run = record.finish(&ctx);
        match &run.failure {
            None => info!(run_id = %run.id, "Pipeline finished: Done"),
            Some(failure) => error!(
                run_id = %run.id,
                "Pipeline finished: Failed ({}, exit {})",
                failure.kind,
                failure.exit_code
            ),
        }

        self.report(&run).await;
        run
    }

    async fn run_stages(
        &self,
        defs: &Definitions,
        resolved: &ResolvedInventory,
        record: &mut RunRecord,
        ctx: &Arc<RunContext>,
    ) {
        let mut state = PipelineState::Init;

        loop {
            state = state.next();
            let Some(stage) = state.stage() else {
                break;
            };

            if self.config.mode == RunMode::SyntaxCheck && stage != Stage::Lint {
                record.stages.push(StageOutcome::skipped(stage, "syntax check"));
                continue;
            }

            let budget = self.config.timeouts.for_stage(stage);
            let started_at = Utc::now();
            let start = Instant::now();
            ctx.log_info(format!("Stage {} started", stage));

            let result = match tokio::time::timeout(
                budget,
                self.run_stage(stage, defs, resolved, record, ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout {
                    stage,
                    seconds: budget.as_secs(),
                }),
            };

            let duration_ms = start.elapsed().as_millis() as u64;
            let (status, message) = match &result {
                Ok(StageEnd::Succeeded(message)) => (StageStatus::Succeeded, message.clone()),
                Ok(StageEnd::Skipped(reason)) => (StageStatus::Skipped, reason.clone()),
                Err(e) => (StageStatus::Failed, e.to_string()),
            };
            record.stages.push(StageOutcome {
                stage,
                status,
                started_at: Some(started_at),
                duration_ms: Some(duration_ms),
                message: Some(message.clone()),
            });

            if let Err(e) = result {
                ctx.log_error(format!("Stage {} failed: {}", stage, message));
                record.fail(&e);
                record.skip_remaining(&format!("{} failed", stage));
                break;
            }
            ctx.log_info(format!("Stage {} {}: {}", stage, status_word(status), message));
        }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        defs: &Definitions,
        resolved: &ResolvedInventory,
        record: &mut RunRecord,
        ctx: &Arc<RunContext>,
    ) -> Result<StageEnd, PipelineError> {
        match stage {
            Stage::Lint => self.lint(defs, resolved, record, ctx).await,
            Stage::Scan => self.scan(record, ctx).await,
            Stage::Converge => self.converge(defs, resolved, record, ctx).await,
            Stage::Verify => self.verify(defs, record).await,
        }
    }

    async fn lint(
        &self,
        defs: &Definitions,
        resolved: &ResolvedInventory,
        record: &mut RunRecord,
        ctx: &Arc<RunContext>,
    ) -> Result<StageEnd, PipelineError> {
        let gate = QualityGate::new(self.config.lint_min_level, Arc::clone(&self.renderer));

        // On timeout the stage stops waiting; the check itself runs to completion
        let (defs, resolved) = (defs.clone(), resolved.clone());
        let (gate, violations) = tokio::task::spawn_blocking(move || {
            let violations = gate.check(&defs, &resolved);
            (gate, violations)
        })
        .await
        .map_err(|e| PipelineError::Tool {
            stage: Stage::Lint,
            message: format!("quality gate: {}", e),
        })?;

        for violation in &violations {
            ctx.log_warning(violation.to_string());
        }
        record.violations = violations;

        gate.enforce(&record.violations)?;
        Ok(StageEnd::Succeeded(format!(
            "{} non-blocking violation(s)",
            record.violations.len()
        )))
    }

    async fn scan(
        &self,
        record: &mut RunRecord,
        ctx: &Arc<RunContext>,
    ) -> Result<StageEnd, PipelineError> {
        if !self.config.scan_enabled {
            return Ok(StageEnd::Skipped("scanner disabled".to_string()));
        }

        let dir = self.config.scan_dir();
        let findings = self
            .scanner
            .scan(&dir)
            .await
            .map_err(|e| PipelineError::Tool {
                stage: Stage::Scan,
                message: format!("{}: {:#}", self.scanner.name(), e),
            })?;

        let summary = policy::evaluate(findings, self.config.critical_artifact_threshold);
        for artifact in &summary.critical_artifacts {
            ctx.log_warning(format!("CRITICAL finding(s) in {}", artifact));
        }
        let message = format!(
            "{} finding(s), {} artifact(s) with CRITICAL findings (threshold {})",
            summary.findings.len(),
            summary.critical_artifacts.len(),
            summary.threshold
        );
        let verdict = policy::enforce(&summary);
        record.policy = Some(summary);
        verdict?;

        Ok(StageEnd::Succeeded(message))
    }

    async fn converge(
        &self,
        defs: &Definitions,
        resolved: &ResolvedInventory,
        record: &mut RunRecord,
        ctx: &Arc<RunContext>,
    ) -> Result<StageEnd, PipelineError> {
        let mut plans = Vec::new();
        let mut failures = Vec::new();

        for node in resolved.nodes.iter().filter(|n| !n.roles.is_empty()) {
            match NodePlan::build(&defs.site, node) {
                Ok(plan) => plans.push(plan),
                Err(e) => failures.push(ResourceApplyError {
                    node: node.node.name.clone(),
                    task: "plan".to_string(),
                    cause: e.to_string(),
                }),
            }
        }
        if !failures.is_empty() {
            return Err(PipelineError::ResourceApply(failures));
        }

        let engine = ConvergenceEngine::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.renderer),
            self.config.max_parallel_nodes,
        );
        let templates = Arc::new(defs.clone());
        let outcomes = engine.converge_all(plans, templates, Arc::clone(ctx)).await;

        let changed: usize = outcomes.iter().map(|o| o.report.changed()).sum();
        for outcome in outcomes {
            if let Some(failure) = outcome.failure {
                failures.push(failure);
            }
            record.nodes.push(outcome.report);
        }

        if !failures.is_empty() {
            return Err(PipelineError::ResourceApply(failures));
        }
        Ok(StageEnd::Succeeded(format!(
            "{} node(s) converged, {} change(s)",
            record.nodes.len(),
            changed
        )))
    }

    async fn verify(
        &self,
        defs: &Definitions,
        record: &mut RunRecord,
    ) -> Result<StageEnd, PipelineError> {
        let specs: Vec<_> = defs
            .site
            .probes
            .iter()
            .chain(self.config.probes.iter())
            .cloned()
            .collect();

        if specs.is_empty() {
            return Ok(StageEnd::Succeeded("no probes configured".to_string()));
        }

        let (results, outcome) =
            probe::verify_all(self.prober.as_ref(), &specs, RetryPolicy::from(&self.config)).await;
        record.probes = results;
        outcome?;

        Ok(StageEnd::Succeeded(format!("{} probe(s) passed", specs.len())))
    }

    async fn report(&self, run: &PipelineRun) {
        for reporter in &self.reporters {
            if let Err(e) = reporter.report(run).await {
                warn!("Reporter failed: {:#}", e);
            }
        }
    }
}

fn status_word(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Succeeded => "succeeded",
        StageStatus::Failed => "failed",
        StageStatus::Skipped => "skipped",
    }
}
