//! Policy gate
//!
//! Runs a configuration scanner over the definition directory and applies
//! a bounded-risk policy: the gate fails only when more than
//! `critical_artifact_threshold` distinct artifacts carry at least one
//! CRITICAL finding.

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::PipelineError;
use keel_core::domain::finding::{Finding, Severity};
use keel_core::domain::run::PolicySummary;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Security scanner collaborator
#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;

    /// Scans a directory; artifacts are reported relative to it
    async fn scan(&self, dir: &Path) -> Result<Vec<Finding>>;
}

/// `trivy config --format json --quiet <dir>`
pub struct TrivyScanner {
    binary: String,
}

impl TrivyScanner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Maps a Trivy JSON report to findings
    pub fn parse_report(json: &str) -> Result<Vec<Finding>> {
        let report: TrivyReport =
            serde_json::from_str(json).context("Failed to parse Trivy JSON report")?;

        let mut findings = Vec::new();
        for result in report.results {
            for misconfig in result.misconfigurations {
                if misconfig.status.as_deref() == Some("PASS") {
                    continue;
                }
                findings.push(Finding {
                    artifact: result.target.clone(),
                    location: misconfig
                        .cause_metadata
                        .and_then(|c| c.start_line)
                        .map(|line| format!("L{}", line)),
                    rule_id: misconfig.id,
                    title: misconfig.title,
                    severity: parse_severity(&misconfig.severity),
                });
            }
            for vuln in result.vulnerabilities {
                findings.push(Finding {
                    artifact: result.target.clone(),
                    location: vuln.pkg_name,
                    title: vuln.title.unwrap_or_else(|| vuln.vulnerability_id.clone()),
                    rule_id: vuln.vulnerability_id,
                    severity: parse_severity(&vuln.severity),
                });
            }
        }

        Ok(findings)
    }
}

fn parse_severity(raw: &str) -> Severity {
    raw.parse().unwrap_or(Severity::Unknown)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyReport {
    #[serde(default)]
    results: Vec<TrivyResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyResult {
    target: String,
    #[serde(default)]
    misconfigurations: Vec<TrivyMisconfiguration>,
    #[serde(default)]
    vulnerabilities: Vec<TrivyVulnerability>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyMisconfiguration {
    #[serde(rename = "ID")]
    id: String,
    title: String,
    severity: String,
    status: Option<String>,
    cause_metadata: Option<TrivyCause>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyCause {
    start_line: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    vulnerability_id: String,
    pkg_name: Option<String>,
    title: Option<String>,
    severity: String,
}

#[async_trait]
impl Scanner for TrivyScanner {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn scan(&self, dir: &Path) -> Result<Vec<Finding>> {
        debug!("Running {} config scan on {}", self.binary, dir.display());

        let output = Command::new(&self.binary)
            .arg("config")
            .arg("--format")
            .arg("json")
            .arg("--quiet")
            .arg(dir)
            .output()
            .await
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.binary))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.binary,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let findings = Self::parse_report(&String::from_utf8_lossy(&output.stdout))?;
        info!("{} reported {} finding(s)", self.binary, findings.len());
        Ok(findings)
    }
}

/// Groups findings by artifact and counts the critical ones
pub fn evaluate(findings: Vec<Finding>, threshold: usize) -> PolicySummary {
    let critical_artifacts: BTreeSet<String> = findings
        .iter()
        .filter(|f| f.severity == Severity::Critical)
        .map(|f| f.artifact.clone())
        .collect();

    PolicySummary {
        threshold,
        findings,
        critical_artifacts: critical_artifacts.into_iter().collect(),
    }
}

/// Fails with `PolicyViolation` when the count exceeds the threshold
pub fn enforce(summary: &PolicySummary) -> Result<(), PipelineError> {
    if summary.passed() {
        Ok(())
    } else {
        Err(PipelineError::PolicyViolation {
            critical_artifacts: summary.critical_artifacts.clone(),
            threshold: summary.threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(artifact: &str, severity: Severity) -> Finding {
        Finding {
            artifact: artifact.to_string(),
            location: None,
            rule_id: "DS002".to_string(),
            title: "Image user should not be 'root'".to_string(),
            severity,
        }
    }

    #[test]
    fn test_threshold_boundary() {
        let at_threshold = vec![
            finding("Dockerfile.web", Severity::Critical),
            finding("Dockerfile.web", Severity::Critical),
            finding("Dockerfile.lb", Severity::Critical),
            finding("compose.yml", Severity::High),
        ];
        let summary = evaluate(at_threshold, 2);
        assert_eq!(summary.critical_artifacts, vec!["Dockerfile.lb", "Dockerfile.web"]);
        assert!(enforce(&summary).is_ok());

        let over = vec![
            finding("Dockerfile.web", Severity::Critical),
            finding("Dockerfile.lb", Severity::Critical),
            finding("Dockerfile.db", Severity::Critical),
        ];
        let err = enforce(&evaluate(over, 2)).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        match err {
            PipelineError::PolicyViolation {
                critical_artifacts,
                threshold,
            } => {
                assert_eq!(critical_artifacts.len(), 3);
                assert_eq!(threshold, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_zero_threshold_fails_on_any_critical() {
        let summary = evaluate(vec![finding("Dockerfile", Severity::Critical)], 0);
        assert!(enforce(&summary).is_err());
        assert!(enforce(&evaluate(vec![finding("Dockerfile", Severity::High)], 0)).is_ok());
    }

    #[test]
    fn test_parse_trivy_report() {
        let json = r#"{
            "SchemaVersion": 2,
            "ArtifactName": "lab",
            "Results": [
                {
                    "Target": "Dockerfile",
                    "Class": "config",
                    "Type": "dockerfile",
                    "Misconfigurations": [
                        {
                            "ID": "DS002",
                            "AVDID": "AVD-DS-0002",
                            "Title": "Image user should not be 'root'",
                            "Severity": "HIGH",
                            "Status": "FAIL",
                            "CauseMetadata": { "StartLine": 3, "EndLine": 3 }
                        },
                        {
                            "ID": "DS026",
                            "Title": "No HEALTHCHECK defined",
                            "Severity": "LOW",
                            "Status": "PASS"
                        }
                    ]
                },
                {
                    "Target": "compose.yml",
                    "Class": "config",
                    "Misconfigurations": [
                        {
                            "ID": "KSV017",
                            "Title": "Privileged container",
                            "Severity": "CRITICAL",
                            "Status": "FAIL"
                        }
                    ]
                },
                { "Target": "site.lua", "Class": "config" }
            ]
        }"#;

        let findings = TrivyScanner::parse_report(json).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].artifact, "Dockerfile");
        assert_eq!(findings[0].location.as_deref(), Some("L3"));
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[1].severity, Severity::Critical);
    }

    #[test]
    fn test_empty_report() {
        assert!(TrivyScanner::parse_report("{}").unwrap().is_empty());
        assert!(TrivyScanner::parse_report("not json").is_err());
    }
}
