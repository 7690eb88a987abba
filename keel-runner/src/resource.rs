//! Resource assertions
//!
//! Each resource kind has a current-state check and an apply action. The
//! engine only calls `apply` when `check` reports drift, so applying an
//! assertion to a node already in the desired state reports `Unchanged`.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use keel_core::domain::Vars;
use keel_core::domain::role::{PackageState, ResourceSpec, ServiceState};
use keel_core::domain::run::ChangeStatus;

use crate::host::Host;
use crate::template::TemplateRenderer;

/// One desired-state assertion, ready to run on a host
#[async_trait]
pub trait Resource: Send + Sync {
    fn describe(&self) -> String;

    /// True if the host is already in the desired state
    async fn check(&self, host: &dyn Host) -> Result<bool>;

    async fn apply(&self, host: &dyn Host) -> Result<()>;
}

/// Check, then apply only on drift
pub async fn converge(resource: &dyn Resource, host: &dyn Host) -> Result<ChangeStatus> {
    if resource.check(host).await.context("check failed")? {
        return Ok(ChangeStatus::Unchanged);
    }
    resource.apply(host).await.context("apply failed")?;
    Ok(ChangeStatus::Changed)
}

/// Where template sources come from
pub trait TemplateSource: Send + Sync {
    fn template(&self, src: &str) -> Option<&str>;
}

impl TemplateSource for crate::definitions::Definitions {
    fn template(&self, src: &str) -> Option<&str> {
        crate::definitions::Definitions::template(self, src)
    }
}

/// Builds the runnable resource for a spec
///
/// File content is rendered here, so rendering problems surface before the
/// host is touched.
pub fn build(
    spec: &ResourceSpec,
    vars: &Vars,
    templates: &dyn TemplateSource,
    renderer: &dyn TemplateRenderer,
) -> Result<Box<dyn Resource>> {
    let resource: Box<dyn Resource> = match spec {
        ResourceSpec::Package { name, state } => Box::new(PackageResource {
            name: name.clone(),
            state: *state,
        }),
        ResourceSpec::Template { src, dest, mode } => {
            let source = templates
                .template(src)
                .ok_or_else(|| anyhow!("template '{}' not found", src))?;
            let content = renderer
                .render(source, vars)
                .with_context(|| format!("rendering template '{}'", src))?;
            Box::new(FileResource {
                path: dest.clone(),
                content,
                mode: mode.as_deref().map(normalize_mode),
            })
        }
        ResourceSpec::Copy {
            content,
            dest,
            mode,
        } => {
            let content = renderer
                .render(content, vars)
                .with_context(|| format!("rendering content of '{}'", dest))?;
            Box::new(FileResource {
                path: dest.clone(),
                content,
                mode: mode.as_deref().map(normalize_mode),
            })
        }
        ResourceSpec::Directory { path, mode } => Box::new(DirectoryResource {
            path: path.clone(),
            mode: mode.as_deref().map(normalize_mode),
        }),
        ResourceSpec::Service {
            name,
            state,
            enabled,
        } => Box::new(ServiceResource {
            name: name.clone(),
            running: *state == ServiceState::Started,
            enabled: *enabled,
        }),
    };
    Ok(resource)
}

/// `0644` and `644` are the same mode
pub fn normalize_mode(mode: &str) -> String {
    let trimmed = mode.trim().trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// True for 3 or 4 octal digits as written (`644`, `0644`, `2775`)
pub fn is_valid_mode(mode: &str) -> bool {
    let mode = mode.trim();
    (3..=4).contains(&mode.len()) && mode.chars().all(|c| ('0'..='7').contains(&c))
}

pub struct PackageResource {
    name: String,
    state: PackageState,
}

#[async_trait]
impl Resource for PackageResource {
    fn describe(&self) -> String {
        format!("package[{}]", self.name)
    }

    async fn check(&self, host: &dyn Host) -> Result<bool> {
        let installed = host.package_installed(&self.name).await?;
        Ok(installed == (self.state == PackageState::Present))
    }

    async fn apply(&self, host: &dyn Host) -> Result<()> {
        match self.state {
            PackageState::Present => host.install_package(&self.name).await,
            PackageState::Absent => host.remove_package(&self.name).await,
        }
    }
}

/// A file with known content (rendered template or copy)
pub struct FileResource {
    path: String,
    content: String,
    mode: Option<String>,
}

impl FileResource {
    async fn mode_matches(&self, host: &dyn Host) -> Result<bool> {
        match &self.mode {
            None => Ok(true),
            Some(mode) => Ok(host
                .file_mode(&self.path)
                .await?
                .map(|current| normalize_mode(&current) == *mode)
                .unwrap_or(false)),
        }
    }
}

#[async_trait]
impl Resource for FileResource {
    fn describe(&self) -> String {
        format!("file[{}]", self.path)
    }

    async fn check(&self, host: &dyn Host) -> Result<bool> {
        let current = host.read_file(&self.path).await?;
        if current.as_deref() != Some(self.content.as_str()) {
            return Ok(false);
        }
        self.mode_matches(host).await
    }

    async fn apply(&self, host: &dyn Host) -> Result<()> {
        if host.read_file(&self.path).await?.as_deref() != Some(self.content.as_str()) {
            host.write_file(&self.path, &self.content).await?;
        }
        if let Some(mode) = &self.mode {
            if !self.mode_matches(host).await? {
                host.set_mode(&self.path, mode).await?;
            }
        }
        Ok(())
    }
}

pub struct DirectoryResource {
    path: String,
    mode: Option<String>,
}

#[async_trait]
impl Resource for DirectoryResource {
    fn describe(&self) -> String {
        format!("directory[{}]", self.path)
    }

    async fn check(&self, host: &dyn Host) -> Result<bool> {
        if !host.is_directory(&self.path).await? {
            return Ok(false);
        }
        match &self.mode {
            None => Ok(true),
            Some(mode) => Ok(host
                .file_mode(&self.path)
                .await?
                .map(|current| normalize_mode(&current) == *mode)
                .unwrap_or(false)),
        }
    }

    async fn apply(&self, host: &dyn Host) -> Result<()> {
        if !host.is_directory(&self.path).await? {
            host.create_directory(&self.path).await?;
        }
        if let Some(mode) = &self.mode {
            host.set_mode(&self.path, mode).await?;
        }
        Ok(())
    }
}

pub struct ServiceResource {
    name: String,
    running: bool,
    enabled: Option<bool>,
}

#[async_trait]
impl Resource for ServiceResource {
    fn describe(&self) -> String {
        format!("service[{}]", self.name)
    }

    async fn check(&self, host: &dyn Host) -> Result<bool> {
        if host.service_running(&self.name).await? != self.running {
            return Ok(false);
        }
        match self.enabled {
            None => Ok(true),
            Some(enabled) => Ok(host.service_enabled(&self.name).await? == enabled),
        }
    }

    async fn apply(&self, host: &dyn Host) -> Result<()> {
        if let Some(enabled) = self.enabled {
            if host.service_enabled(&self.name).await? != enabled {
                host.set_service_enabled(&self.name, enabled).await?;
            }
        }
        if host.service_running(&self.name).await? != self.running {
            host.set_service_running(&self.name, self.running).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::Definitions;
    use crate::template::PlaceholderRenderer;
    use crate::testing::{MemoryHost, lab_inventory, lab_site};
    use serde_json::json;

    fn defs() -> Definitions {
        Definitions::new(lab_site(), lab_inventory())
            .with_template("index.html.tmpl", "<h1>{{ greeting }}</h1>\n")
    }

    fn vars() -> Vars {
        [("greeting".to_string(), json!("hello"))].into()
    }

    async fn twice(spec: &ResourceSpec, host: &MemoryHost) -> (ChangeStatus, ChangeStatus) {
        let resource = build(spec, &vars(), &defs(), &PlaceholderRenderer).unwrap();
        let first = converge(resource.as_ref(), host).await.unwrap();
        let second = converge(resource.as_ref(), host).await.unwrap();
        (first, second)
    }

    #[tokio::test]
    async fn test_every_kind_is_idempotent() {
        let specs = vec![
            ResourceSpec::Package {
                name: "nginx".into(),
                state: PackageState::Present,
            },
            ResourceSpec::Template {
                src: "index.html.tmpl".into(),
                dest: "/var/www/html/index.html".into(),
                mode: Some("0644".into()),
            },
            ResourceSpec::Copy {
                content: "listen 80;".into(),
                dest: "/etc/nginx/conf.d/port.conf".into(),
                mode: None,
            },
            ResourceSpec::Directory {
                path: "/srv/www".into(),
                mode: Some("755".into()),
            },
            ResourceSpec::Service {
                name: "nginx".into(),
                state: ServiceState::Started,
                enabled: Some(true),
            },
        ];

        for spec in &specs {
            let host = MemoryHost::new("web1");
            let (first, second) = twice(spec, &host).await;
            assert_eq!(first, ChangeStatus::Changed, "{}", spec.describe());
            assert_eq!(second, ChangeStatus::Unchanged, "{}", spec.describe());
        }
    }

    #[tokio::test]
    async fn test_absent_package_on_clean_host_is_unchanged() {
        let host = MemoryHost::new("web1");
        let spec = ResourceSpec::Package {
            name: "telnetd".into(),
            state: PackageState::Absent,
        };
        assert_eq!(twice(&spec, &host).await, (ChangeStatus::Unchanged, ChangeStatus::Unchanged));
    }

    #[tokio::test]
    async fn test_template_renders_variables() {
        let host = MemoryHost::new("web1");
        let spec = ResourceSpec::Template {
            src: "index.html.tmpl".into(),
            dest: "/var/www/html/index.html".into(),
            mode: Some("0644".into()),
        };
        twice(&spec, &host).await;

        assert_eq!(
            host.file("/var/www/html/index.html").as_deref(),
            Some("<h1>hello</h1>\n")
        );
        assert_eq!(host.mode("/var/www/html/index.html").as_deref(), Some("644"));
    }

    #[tokio::test]
    async fn test_mode_drift_alone_is_a_change() {
        let host = MemoryHost::new("web1");
        host.put_file("/etc/motd", "hi", "600");

        let spec = ResourceSpec::Copy {
            content: "hi".into(),
            dest: "/etc/motd".into(),
            mode: Some("0644".into()),
        };
        assert_eq!(twice(&spec, &host).await.0, ChangeStatus::Changed);
        assert_eq!(host.mode("/etc/motd").as_deref(), Some("644"));
        assert_eq!(host.writes(), 0);
    }

    #[test]
    fn test_missing_template_fails_build() {
        let spec = ResourceSpec::Template {
            src: "absent.tmpl".into(),
            dest: "/x".into(),
            mode: None,
        };
        let err = build(&spec, &vars(), &defs(), &PlaceholderRenderer)
            .err()
            .unwrap();
        assert!(err.to_string().contains("absent.tmpl"));
    }

    #[test]
    fn test_modes() {
        assert_eq!(normalize_mode("0644"), "644");
        assert_eq!(normalize_mode("644"), "644");
        assert_eq!(normalize_mode("0000"), "0");
        assert!(is_valid_mode("0755"));
        assert!(is_valid_mode("2775"));
        assert!(!is_valid_mode("0855"));
        assert!(!is_valid_mode("rw-r--r--"));
        assert!(!is_valid_mode("17555"));
        assert!(!is_valid_mode("44"));
        assert!(!is_valid_mode("7"));
        assert!(!is_valid_mode("000644"));
        assert!(is_valid_mode("644"));
    }
}
