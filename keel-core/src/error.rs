//! Error types for the Keel pipeline

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::lint::Violation;
use crate::domain::run::Stage;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that halt a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed inventory, group or role references (pre-flight)
    #[error("configuration error: {0}")]
    Config(String),

    /// Lint violations at or above the minimum level, or dry-run failures
    #[error("validation failed with {} violation(s): {}", .violations.len(), summarize(.violations))]
    Validation { violations: Vec<Violation> },

    /// Too many artifacts carry CRITICAL findings
    #[error(
        "policy violation: {} artifact(s) with CRITICAL findings exceed threshold {threshold}: {}",
        .critical_artifacts.len(),
        .critical_artifacts.join(", ")
    )]
    PolicyViolation {
        critical_artifacts: Vec<String>,
        threshold: usize,
    },

    /// One or more nodes failed to converge
    #[error("{} node(s) failed to converge: {}", .0.len(), join_errors(.0))]
    ResourceApply(Vec<ResourceApplyError>),

    /// A post-deployment probe failed
    #[error("verification failed for {probe}: {reason}")]
    Verification { probe: String, reason: String },

    /// An external collaborator could not be run
    #[error("{stage} tool error: {message}")]
    Tool { stage: Stage, message: String },

    /// A stage exceeded its configured budget
    #[error("{stage} stage timed out after {seconds}s")]
    Timeout { stage: Stage, seconds: u64 },
}

/// Failure applying one assertion on one node
#[derive(Debug, Clone, Error)]
#[error("node '{node}', task '{task}': {cause}")]
pub struct ResourceApplyError {
    pub node: String,
    pub task: String,
    pub cause: String,
}

/// Serializable classification of a `PipelineError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Validation,
    PolicyViolation,
    ResourceApply,
    Verification,
    Tool,
    Timeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::PolicyViolation => "PolicyViolation",
            ErrorKind::ResourceApply => "ResourceApplyError",
            ErrorKind::Verification => "VerificationError",
            ErrorKind::Tool => "ToolError",
            ErrorKind::Timeout => "TimeoutError",
        };
        write!(f, "{}", name)
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Validation { .. } => ErrorKind::Validation,
            PipelineError::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            PipelineError::ResourceApply(_) => ErrorKind::ResourceApply,
            PipelineError::Verification { .. } => ErrorKind::Verification,
            PipelineError::Tool { .. } => ErrorKind::Tool,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Stage the error belongs to, when it is stage-specific
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Config(_) => None,
            PipelineError::Validation { .. } => Some(Stage::Lint),
            PipelineError::PolicyViolation { .. } => Some(Stage::Scan),
            PipelineError::ResourceApply(_) => Some(Stage::Converge),
            PipelineError::Verification { .. } => Some(Stage::Verify),
            PipelineError::Tool { stage, .. } | PipelineError::Timeout { stage, .. } => {
                Some(*stage)
            }
        }
    }

    /// Process exit status for scripting consumers
    pub fn exit_code(&self) -> i32 {
        match self.stage() {
            Some(stage) => stage.exit_code(),
            None => 2,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config(message.into())
    }
}

fn summarize(violations: &[Violation]) -> String {
    const SHOWN: usize = 3;
    let mut parts: Vec<String> = violations.iter().take(SHOWN).map(|v| v.to_string()).collect();
    if violations.len() > SHOWN {
        parts.push(format!("and {} more", violations.len() - SHOWN));
    }
    parts.join("; ")
}

fn join_errors(errors: &[ResourceApplyError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
