//! Quality gate violations

use serde::{Deserialize, Serialize};

/// Violation level, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LintLevel {
    Info,
    Warning,
    Error,
}

impl std::str::FromStr for LintLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(LintLevel::Info),
            "warning" | "warn" => Ok(LintLevel::Warning),
            "error" => Ok(LintLevel::Error),
            other => Err(format!("unknown lint level '{}'", other)),
        }
    }
}

impl std::fmt::Display for LintLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LintLevel::Info => write!(f, "info"),
            LintLevel::Warning => write!(f, "warning"),
            LintLevel::Error => write!(f, "error"),
        }
    }
}

/// A lint or dry-run problem in the definitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Rule identifier, e.g. `file-mode-missing`
    pub rule: String,
    pub level: LintLevel,
    pub message: String,

    /// Where the problem is, e.g. `role nginx / task "render index"`
    pub location: String,
}

impl Violation {
    pub fn new(
        rule: &str,
        level: LintLevel,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule: rule.to_string(),
            level,
            message: message.into(),
            location: location.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({}): {}",
            self.level, self.rule, self.location, self.message
        )
    }
}
