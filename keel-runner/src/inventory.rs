//! Inventory resolution
//!
//! Turns the declared inventory and plays into per-node facts: merged
//! variables and the ordered role names that apply. Play selectors are
//! evaluated exactly once, here.
//!
//! Variable precedence, lowest first:
//! 1. role defaults (applied later by the planner)
//! 2. inventory `vars`
//! 3. group vars, in inventory declaration order
//! 4. host vars
//! 5. extra variables from the command line

use keel_core::PipelineError;
use keel_core::domain::Vars;
use keel_core::domain::inventory::{ALL_GROUP, Inventory, Node};
use keel_core::domain::role::Site;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// A node with everything resolved for it
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedNode {
    pub node: Node,
    pub vars: Vars,

    /// Role names selected by plays, in play order, without duplicates
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolvedInventory {
    pub nodes: Vec<ResolvedNode>,
}

impl ResolvedInventory {
    pub fn node(&self, name: &str) -> Option<&ResolvedNode> {
        self.nodes.iter().find(|n| n.node.name == name)
    }
}

/// Resolves every node of the inventory against the site's plays
///
/// Fails with `ConfigError` when the definitions reference something that
/// does not exist; see [`check_references`].
pub fn resolve(
    inventory: &Inventory,
    site: &Site,
    extra_vars: &BTreeMap<String, String>,
) -> Result<ResolvedInventory, PipelineError> {
    check_references(inventory, site)?;

    let nodes = inventory
        .nodes
        .iter()
        .map(|node| ResolvedNode {
            node: node.clone(),
            vars: merged_vars(inventory, node, extra_vars),
            roles: selected_roles(site, node),
        })
        .collect();

    Ok(ResolvedInventory { nodes })
}

/// Merged variables of one node, role defaults excluded
pub fn merged_vars(inventory: &Inventory, node: &Node, extra_vars: &BTreeMap<String, String>) -> Vars {
    let mut vars = inventory.vars.clone();

    for group in &inventory.groups {
        if node.is_member(&group.name) {
            vars.extend(group.vars.clone());
        }
    }

    vars.extend(node.vars.clone());
    vars.extend(
        extra_vars
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()))),
    );
    vars
}

fn selected_roles(site: &Site, node: &Node) -> Vec<String> {
    let mut roles: Vec<String> = Vec::new();
    for play in site.plays.iter().filter(|p| p.hosts.matches(node)) {
        for role in &play.roles {
            if !roles.contains(role) {
                roles.push(role.clone());
            }
        }
    }
    roles
}

/// Reference checks that must hold before anything else runs
///
/// All problems are reported at once in a single `ConfigError`.
pub fn check_references(inventory: &Inventory, site: &Site) -> Result<(), PipelineError> {
    let mut problems = Vec::new();

    let mut seen = HashSet::new();
    for group in &inventory.groups {
        if group.name == ALL_GROUP {
            problems.push(format!(
                "group '{}' is implicit; put global variables in inventory 'vars'",
                ALL_GROUP
            ));
        } else if !seen.insert(group.name.as_str()) {
            problems.push(format!("group '{}' is declared more than once", group.name));
        }
    }

    let mut seen = HashSet::new();
    for node in &inventory.nodes {
        if !seen.insert(node.name.as_str()) {
            problems.push(format!("node '{}' is declared more than once", node.name));
        }
        if node.connection.container.trim().is_empty() {
            problems.push(format!("node '{}' has an empty connection", node.name));
        }
        for group in &node.groups {
            if !inventory.is_group(group) {
                problems.push(format!(
                    "node '{}' references undeclared group '{}'",
                    node.name, group
                ));
            }
        }
    }

    for play in &site.plays {
        for group in play.hosts.groups() {
            if !inventory.is_group(group) {
                problems.push(format!(
                    "play '{}' selects undeclared group '{}'",
                    play.label(),
                    group
                ));
            }
        }
    }

    for role in &site.roles {
        for task in &role.tasks {
            for handler in &task.notify {
                if role.handler(handler).is_none() {
                    problems.push(format!(
                        "task '{}' in role '{}' notifies unknown handler '{}'",
                        task.label(),
                        role.name,
                        handler
                    ));
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Config(problems.join("; ")))
    }
}
