//! Role, task and play domain types

use serde::{Deserialize, Serialize};

use super::Vars;
use super::probe::ProbeSpec;
use super::selector::Selector;

/// Site definition: everything the pipeline deploys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    pub description: Option<String>,

    /// Roles in declaration order
    pub roles: Vec<Role>,

    /// Plays in execution order
    pub plays: Vec<Play>,

    /// Post-deployment health probes
    #[serde(default)]
    pub probes: Vec<ProbeSpec>,
}

impl Site {
    /// Looks up a role by name
    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }
}

/// A reusable bundle of resource assertions and handlers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,

    /// Roles that must be applied before this one
    #[serde(default)]
    pub depends: Vec<String>,

    /// Default variables, lowest precedence
    #[serde(default)]
    pub defaults: Vars,

    /// Ordered assertions
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub handlers: Vec<Handler>,
}

impl Role {
    /// Looks up a handler declared by this role
    pub fn handler(&self, name: &str) -> Option<&Handler> {
        self.handlers.iter().find(|h| h.name == name)
    }
}

/// A single desired-state declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: Option<String>,
    pub resource: ResourceSpec,

    /// Handlers to notify when this task reports a change
    #[serde(default)]
    pub notify: Vec<String>,
}

impl Task {
    /// Display label: the task name, or the resource description
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.resource.describe())
    }
}

/// Desired end-state of one managed resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Package {
        name: String,
        state: PackageState,
    },
    /// File rendered from a template under the site's `templates/` directory
    Template {
        src: String,
        dest: String,
        mode: Option<String>,
    },
    /// File with inline content (placeholders are rendered too)
    Copy {
        content: String,
        dest: String,
        mode: Option<String>,
    },
    Directory {
        path: String,
        mode: Option<String>,
    },
    Service {
        name: String,
        state: ServiceState,
        enabled: Option<bool>,
    },
}

impl ResourceSpec {
    /// Short resource kind name
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceSpec::Package { .. } => "package",
            ResourceSpec::Template { .. } => "template",
            ResourceSpec::Copy { .. } => "copy",
            ResourceSpec::Directory { .. } => "directory",
            ResourceSpec::Service { .. } => "service",
        }
    }

    /// Human-readable identity, e.g. `package[nginx]`
    pub fn describe(&self) -> String {
        let target = match self {
            ResourceSpec::Package { name, .. } | ResourceSpec::Service { name, .. } => name,
            ResourceSpec::Template { dest, .. } | ResourceSpec::Copy { dest, .. } => dest,
            ResourceSpec::Directory { path, .. } => path,
        };
        format!("{}[{}]", self.kind(), target)
    }

    /// File mode, for resources that manage one
    pub fn mode(&self) -> Option<&str> {
        match self {
            ResourceSpec::Template { mode, .. }
            | ResourceSpec::Copy { mode, .. }
            | ResourceSpec::Directory { mode, .. } => mode.as_deref(),
            _ => None,
        }
    }

    /// Managed filesystem path, for resources that manage one
    pub fn path(&self) -> Option<&str> {
        match self {
            ResourceSpec::Template { dest, .. } | ResourceSpec::Copy { dest, .. } => Some(dest),
            ResourceSpec::Directory { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    #[default]
    Present,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Started,
    Stopped,
}

/// A named, change-triggered side effect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handler {
    pub name: String,
    pub action: HandlerAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerAction {
    Service { name: String, action: ServiceAction },
    Command { cmd: String, args: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Restart,
    Reload,
}

impl std::fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceAction::Restart => write!(f, "restart"),
            ServiceAction::Reload => write!(f, "reload"),
        }
    }
}

/// Applies roles to the nodes a selector matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Play {
    pub name: Option<String>,
    pub hosts: Selector,
    pub roles: Vec<String>,
}

impl Play {
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("hosts {}", self.hosts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_describe() {
        let spec = ResourceSpec::Template {
            src: "index.html.tmpl".to_string(),
            dest: "/var/www/html/index.html".to_string(),
            mode: Some("0644".to_string()),
        };
        assert_eq!(spec.describe(), "template[/var/www/html/index.html]");
        assert_eq!(spec.mode(), Some("0644"));
        assert_eq!(spec.path(), Some("/var/www/html/index.html"));

        let spec = ResourceSpec::Package {
            name: "nginx".to_string(),
            state: PackageState::Present,
        };
        assert_eq!(spec.describe(), "package[nginx]");
        assert_eq!(spec.path(), None);
    }

    #[test]
    fn test_task_label_falls_back_to_resource() {
        let task = Task {
            name: None,
            resource: ResourceSpec::Directory {
                path: "/srv".to_string(),
                mode: None,
            },
            notify: vec![],
        };
        assert_eq!(task.label(), "directory[/srv]");
    }

    #[test]
    fn test_resource_spec_serializes_with_kind_tag() {
        let spec = ResourceSpec::Service {
            name: "nginx".to_string(),
            state: ServiceState::Started,
            enabled: Some(true),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "service");
        assert_eq!(json["state"], "started");
    }
}
