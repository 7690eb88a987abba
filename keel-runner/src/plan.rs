//! Node plans
//!
//! Expands the role names selected for a node into the ordered list of
//! roles to apply: dependencies first, each role at most once.

use keel_core::domain::Vars;
use keel_core::domain::inventory::Node;
use keel_core::domain::role::{Handler, Role, Site, Task};
use thiserror::Error;

use crate::inventory::ResolvedNode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("unknown role '{role}'{}", required_by_suffix(.required_by))]
    UnknownRole {
        role: String,
        required_by: Option<String>,
    },

    #[error("cyclic role dependency: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

fn required_by_suffix(required_by: &Option<String>) -> String {
    match required_by {
        Some(role) => format!(" (required by '{}')", role),
        None => String::new(),
    }
}

/// Everything the convergence engine needs for one node
#[derive(Debug, Clone)]
pub struct NodePlan {
    pub node: Node,

    /// Role defaults overlaid with the node's resolved variables
    pub vars: Vars,

    /// Roles in application order
    pub roles: Vec<Role>,
}

impl NodePlan {
    /// Builds the plan of a resolved node
    pub fn build(site: &Site, resolved: &ResolvedNode) -> Result<Self, PlanError> {
        let roles = expand_roles(site, &resolved.roles)?;

        let mut vars = Vars::new();
        for role in &roles {
            vars.extend(role.defaults.clone());
        }
        vars.extend(resolved.vars.clone());

        Ok(Self {
            node: resolved.node.clone(),
            vars,
            roles: roles.into_iter().cloned().collect(),
        })
    }

    /// Tasks in application order, paired with their role
    pub fn tasks(&self) -> impl Iterator<Item = (&Role, &Task)> {
        self.roles
            .iter()
            .flat_map(|role| role.tasks.iter().map(move |task| (role, task)))
    }

    /// Handler with this name; the first declaration in plan order wins
    pub fn handler(&self, name: &str) -> Option<&Handler> {
        self.roles.iter().find_map(|r| r.handler(name))
    }

    pub fn task_count(&self) -> usize {
        self.roles.iter().map(|r| r.tasks.len()).sum()
    }
}

/// Expands role names dependency-first, each role once
pub fn expand_roles<'a>(site: &'a Site, names: &[String]) -> Result<Vec<&'a Role>, PlanError> {
    let mut ordered = Vec::new();
    let mut stack = Vec::new();

    for name in names {
        visit(site, name, None, &mut stack, &mut ordered)?;
    }

    Ok(ordered)
}

fn visit<'a>(
    site: &'a Site,
    name: &str,
    required_by: Option<&str>,
    stack: &mut Vec<String>,
    ordered: &mut Vec<&'a Role>,
) -> Result<(), PlanError> {
    if ordered.iter().any(|r| r.name == name) {
        return Ok(());
    }

    if let Some(start) = stack.iter().position(|r| r == name) {
        let mut cycle = stack[start..].to_vec();
        cycle.push(name.to_string());
        return Err(PlanError::Cycle(cycle));
    }

    let role = site.role(name).ok_or_else(|| PlanError::UnknownRole {
        role: name.to_string(),
        required_by: required_by.map(str::to_string),
    })?;

    stack.push(name.to_string());
    for dep in &role.depends {
        visit(site, dep, Some(name), stack, ordered)?;
    }
    stack.pop();

    ordered.push(role);
    Ok(())
}
