//! Pipeline run records
//!
//! A `PipelineRun` is the ordered record of what each stage did. It is
//! built by the driver while the run progresses and is immutable once
//! returned; reporters only read it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::finding::Finding;
use super::lint::Violation;
use super::log::LogEntry;
use super::probe::ProbeResult;
use crate::error::ErrorKind;

/// Gated pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Lint,
    Scan,
    Converge,
    Verify,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Lint, Stage::Scan, Stage::Converge, Stage::Verify];

    /// Process exit status used when this stage fails
    pub fn exit_code(&self) -> i32 {
        match self {
            Stage::Lint => 3,
            Stage::Scan => 4,
            Stage::Converge => 5,
            Stage::Verify => 6,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Lint => write!(f, "lint"),
            Stage::Scan => write!(f, "scan"),
            Stage::Converge => write!(f, "converge"),
            Stage::Verify => write!(f, "verify"),
        }
    }
}

/// Driver state machine
///
/// `Init → Lint → Scan → Converge → Verify → Done`; any failure moves to
/// `Failed`. Report runs after either terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Init,
    Lint,
    Scan,
    Converge,
    Verify,
    Done,
    Failed,
}

impl PipelineState {
    /// Next state on the success path
    pub fn next(self) -> PipelineState {
        match self {
            PipelineState::Init => PipelineState::Lint,
            PipelineState::Lint => PipelineState::Scan,
            PipelineState::Scan => PipelineState::Converge,
            PipelineState::Converge => PipelineState::Verify,
            PipelineState::Verify | PipelineState::Done => PipelineState::Done,
            PipelineState::Failed => PipelineState::Failed,
        }
    }

    /// Stage executed while in this state
    pub fn stage(self) -> Option<Stage> {
        match self {
            PipelineState::Lint => Some(Stage::Lint),
            PipelineState::Scan => Some(Stage::Scan),
            PipelineState::Converge => Some(Stage::Converge),
            PipelineState::Verify => Some(Stage::Verify),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// What one stage did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub message: Option<String>,
}

impl StageOutcome {
    pub fn skipped(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            started_at: None,
            duration_ms: None,
            message: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    SyntaxCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Changed,
    Unchanged,
}

/// Result of one assertion on one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub role: String,
    pub task: String,
    pub resource: String,
    pub status: ChangeStatus,
}

/// Convergence record for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: String,
    pub tasks: Vec<TaskReport>,

    /// Handlers fired, in firing order
    pub handlers: Vec<String>,

    /// Set when the node's run aborted
    pub error: Option<String>,
}

impl NodeReport {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            tasks: Vec::new(),
            handlers: Vec::new(),
            error: None,
        }
    }

    pub fn changed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == ChangeStatus::Changed)
            .count()
    }

    pub fn unchanged(&self) -> usize {
        self.tasks.len() - self.changed()
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Policy gate evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySummary {
    pub threshold: usize,
    pub findings: Vec<Finding>,

    /// Distinct artifacts with at least one CRITICAL finding
    pub critical_artifacts: Vec<String>,
}

impl PolicySummary {
    pub fn passed(&self) -> bool {
        self.critical_artifacts.len() <= self.threshold
    }
}

/// Why a run failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    /// Stage that failed; `None` for pre-flight configuration errors
    pub stage: Option<Stage>,
    pub kind: ErrorKind,
    pub message: String,
    pub exit_code: i32,
}

/// Complete record of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub site: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Terminal state: `Done` or `Failed`
    pub state: PipelineState,

    pub stages: Vec<StageOutcome>,
    pub failure: Option<RunFailure>,

    pub violations: Vec<Violation>,
    pub policy: Option<PolicySummary>,
    pub nodes: Vec<NodeReport>,
    pub probes: Vec<ProbeResult>,
    pub logs: Vec<LogEntry>,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Done
    }

    pub fn exit_code(&self) -> i32 {
        self.failure.as_ref().map(|f| f.exit_code).unwrap_or(0)
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages.iter().find(|o| o.stage == stage)
    }

    /// True if the stage was entered (succeeded or failed, not skipped)
    pub fn executed(&self, stage: Stage) -> bool {
        self.outcome(stage)
            .map(|o| o.status != StageStatus::Skipped)
            .unwrap_or(false)
    }
}
