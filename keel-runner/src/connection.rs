//! Container connections
//!
//! Nodes are containers reached through a runtime's exec channel:
//! - Checking the runtime binary is available
//! - Executing commands in a node's container, optionally feeding stdin
//! - Connecting nodes to typed hosts for the convergence engine
//!
//! Container lifecycle (run, stop, rm) is not managed here; the containers
//! must already be running.

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::domain::inventory::{ContainerRuntime, Node};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::host::{Host, ShellHost};

/// Checks if the container runtime is installed and available
pub async fn check_runtime_available(runtime: ContainerRuntime) -> Result<String> {
    let output = Command::new(runtime.binary())
        .arg("--version")
        .output()
        .await
        .with_context(|| {
            format!(
                "Failed to execute '{} --version'. Is {} installed?",
                runtime, runtime
            )
        })?;

    if !output.status.success() {
        anyhow::bail!("{} is not working correctly", runtime);
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    info!("{} is available: {}", runtime, version);

    Ok(version)
}

/// Captured result of a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Short description of a failed command for error messages
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };
        format!("exit_code={} {}", self.exit_code, detail)
    }
}

/// Command execution channel to one node
#[async_trait]
pub trait Connection: Send + Sync {
    /// Human-readable target, for logs
    fn target(&self) -> String;

    /// Runs `cmd args...` on the node
    ///
    /// A non-zero exit code is not an error; only failing to run the
    /// command at all is.
    async fn exec(&self, cmd: &str, args: &[String], stdin: Option<&str>) -> Result<ExecOutput>;
}

/// `<runtime> exec -i <container> ...`
#[derive(Debug, Clone)]
pub struct ContainerConnection {
    runtime: ContainerRuntime,
    container: String,
}

impl ContainerConnection {
    pub fn new(runtime: ContainerRuntime, container: impl Into<String>) -> Self {
        Self {
            runtime,
            container: container.into(),
        }
    }
}

#[async_trait]
impl Connection for ContainerConnection {
    fn target(&self) -> String {
        format!("{}:{}", self.runtime, self.container)
    }

    async fn exec(&self, cmd: &str, args: &[String], stdin: Option<&str>) -> Result<ExecOutput> {
        debug!(
            "Executing in container {}: {} {:?}",
            self.container, cmd, args
        );

        let mut command = Command::new(self.runtime.binary());
        command
            .arg("exec")
            .arg("-i")
            .arg(&self.container)
            .arg(cmd)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to execute {} exec command", self.runtime))?;

        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .context("Failed to open stdin of exec command")?;
            pipe.write_all(input.as_bytes())
                .await
                .context("Failed to write to exec command stdin")?;
            // Closing stdin lets the remote command see EOF
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for exec command")?;

        let result = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if !result.success() {
            debug!(
                "Command failed in container {}: cmd={} exit_code={} stderr='{}'",
                self.container,
                cmd,
                result.exit_code,
                result.stderr.trim()
            );
        }

        Ok(result)
    }
}

/// Opens a typed host for a node
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &Node) -> Result<Box<dyn Host>>;
}

/// Connects nodes through their container runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct ContainerConnector;

#[async_trait]
impl Connector for ContainerConnector {
    async fn connect(&self, node: &Node) -> Result<Box<dyn Host>> {
        check_runtime_available(node.connection.runtime).await?;
        let connection =
            ContainerConnection::new(node.connection.runtime, node.connection.container.clone());
        Ok(Box::new(ShellHost::new(connection)))
    }
}
