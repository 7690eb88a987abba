//! Inventory domain types

use serde::{Deserialize, Serialize};

use super::Vars;

/// Implicit group every node belongs to
pub const ALL_GROUP: &str = "all";

/// Inventory of managed nodes
///
/// Group order is significant: when a node belongs to several groups that
/// define the same variable, the group declared later wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    /// Variables visible to every node
    pub vars: Vars,

    /// Groups in declaration order
    pub groups: Vec<Group>,

    /// Nodes in declaration order
    pub nodes: Vec<Node>,
}

impl Inventory {
    /// Looks up a declared group by name
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Looks up a node by name
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Returns true if the name is a declared group or the implicit `all`
    pub fn is_group(&self, name: &str) -> bool {
        name == ALL_GROUP || self.group(name).is_some()
    }

    /// Nodes that are members of the given group
    pub fn members<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.is_member(group))
    }
}

/// A named set of nodes sharing variables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub vars: Vars,
}

/// A managed target system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,

    /// Group memberships, in the order they were listed for the node
    pub groups: Vec<String>,

    /// How to reach the node
    pub connection: Connection,

    /// Host variables, highest precedence
    #[serde(default)]
    pub vars: Vars,
}

impl Node {
    /// Returns true if the node belongs to the group (every node is in `all`)
    pub fn is_member(&self, group: &str) -> bool {
        group == ALL_GROUP || self.groups.iter().any(|g| g == group)
    }
}

/// Connection descriptor: a container reached through a runtime's exec channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub runtime: ContainerRuntime,
    pub container: String,
}

/// Container runtime used to reach a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Name of the runtime binary
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}

impl std::str::FromStr for ContainerRuntime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(ContainerRuntime::Docker),
            "podman" => Ok(ContainerRuntime::Podman),
            other => Err(format!("unknown container runtime '{}'", other)),
        }
    }
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.binary())
    }
}
