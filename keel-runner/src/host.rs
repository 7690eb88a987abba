//! Typed host operations
//!
//! Resources talk to nodes through the `Host` trait: small check and
//! apply primitives (is this package installed, what mode does this file
//! have). `ShellHost` implements them with POSIX and Debian tools over a
//! `Connection`.

use anyhow::{Result, bail};
use async_trait::async_trait;
use keel_core::domain::role::ServiceAction;
use tracing::debug;

use crate::connection::{Connection, ExecOutput};

/// Check and apply primitives on one node
#[async_trait]
pub trait Host: Send + Sync {
    /// Name used in logs
    fn target(&self) -> String;

    /// Connectivity check run before the first task
    async fn ping(&self) -> Result<()>;

    async fn package_installed(&self, name: &str) -> Result<bool>;
    async fn install_package(&self, name: &str) -> Result<()>;
    async fn remove_package(&self, name: &str) -> Result<()>;

    /// File content, `None` if the file does not exist
    async fn read_file(&self, path: &str) -> Result<Option<String>>;
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Octal permission bits (e.g. `644`), `None` if the path does not exist
    async fn file_mode(&self, path: &str) -> Result<Option<String>>;
    async fn set_mode(&self, path: &str, mode: &str) -> Result<()>;

    async fn is_directory(&self, path: &str) -> Result<bool>;
    async fn create_directory(&self, path: &str) -> Result<()>;

    async fn service_running(&self, name: &str) -> Result<bool>;
    async fn set_service_running(&self, name: &str, running: bool) -> Result<()>;
    async fn service_enabled(&self, name: &str) -> Result<bool>;
    async fn set_service_enabled(&self, name: &str, enabled: bool) -> Result<()>;
    async fn service_action(&self, name: &str, action: ServiceAction) -> Result<()>;

    /// Runs a command, failing on a non-zero exit code
    async fn run_command(&self, cmd: &str, args: &[String]) -> Result<()>;
}

/// Host backed by shell commands over a connection
pub struct ShellHost<C: Connection> {
    conn: C,
}

impl<C: Connection> ShellHost<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    async fn run(&self, cmd: &str, args: &[&str]) -> Result<ExecOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.conn.exec(cmd, &args, None).await
    }

    /// Runs a command whose exit code answers a yes/no question
    async fn test(&self, cmd: &str, args: &[&str]) -> Result<bool> {
        Ok(self.run(cmd, args).await?.success())
    }

    /// Runs a command that must succeed
    async fn must(&self, cmd: &str, args: &[&str]) -> Result<ExecOutput> {
        let output = self.run(cmd, args).await?;
        if !output.success() {
            bail!("'{} {}' failed: {}", cmd, args.join(" "), output.failure_detail());
        }
        Ok(output)
    }

    async fn apt_get(&self, args: &[&str]) -> Result<ExecOutput> {
        let mut full = vec!["DEBIAN_FRONTEND=noninteractive", "apt-get"];
        full.extend_from_slice(args);
        self.run("env", &full).await
    }
}

#[async_trait]
impl<C: Connection> Host for ShellHost<C> {
    fn target(&self) -> String {
        self.conn.target()
    }

    async fn ping(&self) -> Result<()> {
        self.must("true", &[]).await.map(|_| ())
    }

    async fn package_installed(&self, name: &str) -> Result<bool> {
        let output = self.run("dpkg-query", &["-W", "-f=${Status}", name]).await?;
        Ok(output.success() && output.stdout.contains("install ok installed"))
    }

    async fn install_package(&self, name: &str) -> Result<()> {
        let first = self
            .apt_get(&["install", "-y", "--no-install-recommends", name])
            .await?;
        if first.success() {
            return Ok(());
        }

        // Fresh containers ship without package lists
        debug!("apt-get install {} failed, refreshing package lists", name);
        let update = self.apt_get(&["update"]).await?;
        if !update.success() {
            bail!("apt-get update failed: {}", update.failure_detail());
        }

        let retry = self
            .apt_get(&["install", "-y", "--no-install-recommends", name])
            .await?;
        if !retry.success() {
            bail!("apt-get install {} failed: {}", name, retry.failure_detail());
        }
        Ok(())
    }

    async fn remove_package(&self, name: &str) -> Result<()> {
        let output = self.apt_get(&["remove", "-y", name]).await?;
        if !output.success() {
            bail!("apt-get remove {} failed: {}", name, output.failure_detail());
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        if !self.test("test", &["-f", path]).await? {
            return Ok(None);
        }
        Ok(Some(self.must("cat", &[path]).await?.stdout))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let args = vec![
            "-c".to_string(),
            r#"cat > "$1""#.to_string(),
            "sh".to_string(),
            path.to_string(),
        ];
        let output = self.conn.exec("sh", &args, Some(content)).await?;
        if !output.success() {
            bail!("writing {} failed: {}", path, output.failure_detail());
        }
        Ok(())
    }

    async fn file_mode(&self, path: &str) -> Result<Option<String>> {
        let output = self.run("stat", &["-c", "%a", path]).await?;
        if !output.success() {
            if self.test("test", &["-e", path]).await? {
                bail!("stat {} failed: {}", path, output.failure_detail());
            }
            return Ok(None);
        }
        Ok(Some(output.stdout.trim().to_string()))
    }

    async fn set_mode(&self, path: &str, mode: &str) -> Result<()> {
        self.must("chmod", &[mode, path]).await.map(|_| ())
    }

    async fn is_directory(&self, path: &str) -> Result<bool> {
        self.test("test", &["-d", path]).await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.must("mkdir", &["-p", path]).await.map(|_| ())
    }

    async fn service_running(&self, name: &str) -> Result<bool> {
        self.test("service", &[name, "status"]).await
    }

    async fn set_service_running(&self, name: &str, running: bool) -> Result<()> {
        let verb = if running { "start" } else { "stop" };
        self.must("service", &[name, verb]).await.map(|_| ())
    }

    async fn service_enabled(&self, name: &str) -> Result<bool> {
        self.test(
            "sh",
            &[
                "-c",
                r#"for f in /etc/rc2.d/S*"$1"; do [ -e "$f" ] && exit 0; done; exit 1"#,
                "sh",
                name,
            ],
        )
        .await
    }

    async fn set_service_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        if enabled {
            self.must("update-rc.d", &[name, "defaults"]).await?;
            self.must("update-rc.d", &[name, "enable"]).await?;
        } else {
            self.must("update-rc.d", &["-f", name, "remove"]).await?;
        }
        Ok(())
    }

    async fn service_action(&self, name: &str, action: ServiceAction) -> Result<()> {
        let verb = action.to_string();
        self.must("service", &[name, verb.as_str()]).await.map(|_| ())
    }

    async fn run_command(&self, cmd: &str, args: &[String]) -> Result<()> {
        let output = self.conn.exec(cmd, args, None).await?;
        if !output.success() {
            bail!("'{}' failed: {}", cmd, output.failure_detail());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned outputs and records every command line
    #[derive(Default)]
    struct ScriptedConnection {
        replies: Mutex<VecDeque<ExecOutput>>,
        calls: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedConnection {
        fn reply(self, exit_code: i32, stdout: &str) -> Self {
            self.replies.lock().unwrap().push_back(ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
            });
            self
        }

        fn calls(&self) -> Vec<(String, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        fn target(&self) -> String {
            "scripted".to_string()
        }

        async fn exec(&self, cmd: &str, args: &[String], stdin: Option<&str>) -> Result<ExecOutput> {
            let line = std::iter::once(cmd.to_string())
                .chain(args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            self.calls
                .lock()
                .unwrap()
                .push((line, stdin.map(str::to_string)));
            Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_package_installed_parses_dpkg_status() {
        let host = ShellHost::new(ScriptedConnection::default().reply(0, "install ok installed"));
        assert!(host.package_installed("nginx").await.unwrap());

        let host = ShellHost::new(ScriptedConnection::default().reply(1, ""));
        assert!(!host.package_installed("nginx").await.unwrap());
    }

    #[tokio::test]
    async fn test_install_refreshes_lists_after_failure() {
        let conn = ScriptedConnection::default()
            .reply(100, "")
            .reply(0, "")
            .reply(0, "");
        let host = ShellHost::new(conn);
        host.install_package("nginx").await.unwrap();

        let calls = host.conn.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].0.ends_with("apt-get update"));
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let host = ShellHost::new(ScriptedConnection::default().reply(1, ""));
        assert_eq!(host.read_file("/etc/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_file_pipes_content() {
        let host = ShellHost::new(ScriptedConnection::default());
        host.write_file("/var/www/html/index.html", "<h1>hello</h1>")
            .await
            .unwrap();

        let calls = host.conn.calls();
        assert!(calls[0].0.ends_with("/var/www/html/index.html"));
        assert_eq!(calls[0].1.as_deref(), Some("<h1>hello</h1>"));
    }

    #[tokio::test]
    async fn test_file_mode_of_missing_path() {
        let conn = ScriptedConnection::default().reply(1, "").reply(1, "");
        let host = ShellHost::new(conn);
        assert_eq!(host.file_mode("/nope").await.unwrap(), None);

        let host = ShellHost::new(ScriptedConnection::default().reply(0, "644\n"));
        assert_eq!(host.file_mode("/etc/hosts").await.unwrap(), Some("644".into()));
    }

    #[tokio::test]
    async fn test_service_action_failure_is_error() {
        let host = ShellHost::new(ScriptedConnection::default().reply(1, "nginx: config error"));
        let err = host
            .service_action("nginx", ServiceAction::Reload)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("service nginx reload"));
    }
}
