//! Quality gate
//!
//! Two passes over the definitions, neither of which touches a node:
//! - structural lint: leveled rules over roles, tasks, groups and plays
//! - dry run: every node plan is expanded and every file it would write is
//!   rendered with the node's variables
//!
//! The gate fails when a violation reaches the configured minimum level.
//! Dry-run problems are always errors.

use keel_core::PipelineError;
use keel_core::domain::lint::{LintLevel, Violation};
use keel_core::domain::role::{HandlerAction, ResourceSpec, Role, Task};
use std::collections::HashSet;
use std::sync::Arc;

use crate::definitions::{Definitions, is_safe_template_path};
use crate::inventory::ResolvedInventory;
use crate::plan::{NodePlan, PlanError, expand_roles};
use crate::resource::is_valid_mode;
use crate::template::{TemplateError, TemplateRenderer};

/// Binaries a handler should not shell out to when a typed action exists
const MODULE_COMMANDS: [&str; 6] = ["service", "systemctl", "apt-get", "apt", "chmod", "mkdir"];

/// Lint plus dry run, with a blocking threshold
pub struct QualityGate {
    min_level: LintLevel,
    renderer: Arc<dyn TemplateRenderer>,
}

impl QualityGate {
    pub fn new(min_level: LintLevel, renderer: Arc<dyn TemplateRenderer>) -> Self {
        Self {
            min_level,
            renderer,
        }
    }

    /// Every violation found, blocking or not
    pub fn check(&self, defs: &Definitions, resolved: &ResolvedInventory) -> Vec<Violation> {
        let mut violations = lint(defs);
        for violation in dry_run(defs, resolved, self.renderer.as_ref()) {
            if !violations.contains(&violation) {
                violations.push(violation);
            }
        }
        violations
    }

    /// Fails with `ValidationError` carrying the blocking violations
    pub fn enforce(&self, violations: &[Violation]) -> Result<(), PipelineError> {
        let blocking: Vec<Violation> = violations
            .iter()
            .filter(|v| v.level >= self.min_level)
            .cloned()
            .collect();

        if blocking.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Validation {
                violations: blocking,
            })
        }
    }
}

fn task_location(role: &Role, task: &Task) -> String {
    format!("role {} / task \"{}\"", role.name, task.label())
}

/// Structural lint
pub fn lint(defs: &Definitions) -> Vec<Violation> {
    let mut violations = Vec::new();
    let site = &defs.site;
    let inventory = &defs.inventory;

    for role in &site.roles {
        let location = format!("role {}", role.name);

        if role.tasks.is_empty() && role.depends.is_empty() {
            violations.push(Violation::new(
                "role-empty",
                LintLevel::Warning,
                &location,
                "role has no tasks",
            ));
        }

        let mut names = HashSet::new();
        for task in &role.tasks {
            lint_task(role, task, &mut names, &mut violations);
        }

        for handler in &role.handlers {
            let location = format!("role {} / handler \"{}\"", role.name, handler.name);

            if !role.tasks.iter().any(|t| t.notify.contains(&handler.name)) {
                violations.push(Violation::new(
                    "handler-unused",
                    LintLevel::Info,
                    &location,
                    "no task notifies this handler",
                ));
            }

            if let HandlerAction::Command { cmd, .. } = &handler.action {
                let binary = cmd.rsplit('/').next().unwrap_or(cmd);
                if MODULE_COMMANDS.contains(&binary) {
                    violations.push(Violation::new(
                        "command-instead-of-module",
                        LintLevel::Warning,
                        &location,
                        format!("'{}' runs a command; use a service action instead", cmd),
                    ));
                }
            }
        }

        let referenced = site.plays.iter().any(|p| p.roles.contains(&role.name))
            || site.roles.iter().any(|r| r.depends.contains(&role.name));
        if !referenced {
            violations.push(Violation::new(
                "role-unused",
                LintLevel::Info,
                &location,
                "role is not applied by any play",
            ));
        }
    }

    for group in &inventory.groups {
        if inventory.members(&group.name).next().is_none() {
            violations.push(Violation::new(
                "group-empty",
                LintLevel::Info,
                format!("group {}", group.name),
                "group has no nodes",
            ));
        }
    }

    for play in &site.plays {
        if !inventory.nodes.iter().any(|n| play.hosts.matches(n)) {
            violations.push(Violation::new(
                "play-no-hosts",
                LintLevel::Warning,
                format!("play \"{}\"", play.label()),
                format!("selector '{}' matches no node", play.hosts),
            ));
        }
    }

    violations
}

fn lint_task<'a>(
    role: &Role,
    task: &'a Task,
    names: &mut HashSet<&'a str>,
    violations: &mut Vec<Violation>,
) {
    let location = task_location(role, task);

    match &task.name {
        None => violations.push(Violation::new(
            "task-name-missing",
            LintLevel::Warning,
            &location,
            "task has no name",
        )),
        Some(name) => {
            if !names.insert(name.as_str()) {
                violations.push(Violation::new(
                    "task-name-duplicate",
                    LintLevel::Warning,
                    &location,
                    format!("task name '{}' is used more than once in this role", name),
                ));
            }
        }
    }

    if let Some(path) = task.resource.path() {
        if !path.starts_with('/') {
            violations.push(Violation::new(
                "path-not-absolute",
                LintLevel::Error,
                &location,
                format!("'{}' is not an absolute path", path),
            ));
        }

        match task.resource.mode() {
            None => violations.push(Violation::new(
                "file-mode-missing",
                LintLevel::Warning,
                &location,
                format!("{} has no explicit mode", task.resource.describe()),
            )),
            Some(mode) if !is_valid_mode(mode) => violations.push(Violation::new(
                "file-mode-invalid",
                LintLevel::Error,
                &location,
                format!("'{}' is not an octal file mode", mode),
            )),
            Some(_) => {}
        }
    }
}

/// Resolves every plan and renders every file without touching a node
pub fn dry_run(
    defs: &Definitions,
    resolved: &ResolvedInventory,
    renderer: &dyn TemplateRenderer,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    // Plays are checked even when they select no node
    for play in &defs.site.plays {
        if let Err(e) = expand_roles(&defs.site, &play.roles) {
            push(plan_violation(&e, format!("play \"{}\"", play.label())), &mut violations);
        }
    }

    for node in &resolved.nodes {
        let plan = match NodePlan::build(&defs.site, node) {
            Ok(plan) => plan,
            Err(e) => {
                push(plan_violation(&e, format!("node {}", node.node.name)), &mut violations);
                continue;
            }
        };

        for (role, task) in plan.tasks() {
            let location = format!("node {} / {}", plan.node.name, task_location(role, task));

            let rendered = match &task.resource {
                ResourceSpec::Template { src, .. } => {
                    let source = if is_safe_template_path(src) {
                        defs.template(src)
                    } else {
                        None
                    };
                    match source {
                        Some(source) => renderer.render(source, &plan.vars),
                        None => {
                            push(
                                Violation::new(
                                    "template-missing",
                                    LintLevel::Error,
                                    format!("{} / {}", role.name, src),
                                    format!("template '{}' not found under templates/", src),
                                ),
                                &mut violations,
                            );
                            continue;
                        }
                    }
                }
                ResourceSpec::Copy { content, .. } => renderer.render(content, &plan.vars),
                _ => continue,
            };

            if let Err(e) = rendered {
                let rule = match e {
                    TemplateError::Undefined(_) => "undefined-variable",
                    TemplateError::Malformed(_) => "template-malformed",
                };
                push(
                    Violation::new(rule, LintLevel::Error, &location, e.to_string()),
                    &mut violations,
                );
            }
        }
    }

    violations
}

fn push(violation: Violation, violations: &mut Vec<Violation>) {
    if !violations.contains(&violation) {
        violations.push(violation);
    }
}

fn plan_violation(error: &PlanError, location: String) -> Violation {
    let rule = match error {
        PlanError::UnknownRole { .. } => "unknown-role",
        PlanError::Cycle(_) => "dependency-cycle",
    };
    Violation::new(rule, LintLevel::Error, location, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::resolve;
    use crate::template::PlaceholderRenderer;
    use crate::testing::{lab_definitions, role};
    use keel_core::domain::role::{Handler, Play};
    use keel_core::domain::selector::Selector;
    use std::collections::BTreeMap;

    fn gate(level: LintLevel) -> QualityGate {
        QualityGate::new(level, Arc::new(PlaceholderRenderer))
    }

    fn check(defs: &Definitions) -> Vec<Violation> {
        let resolved = resolve(&defs.inventory, &defs.site, &BTreeMap::new()).unwrap();
        gate(LintLevel::Warning).check(defs, &resolved)
    }

    fn rules(violations: &[Violation]) -> Vec<&str> {
        violations.iter().map(|v| v.rule.as_str()).collect()
    }

    #[test]
    fn test_lab_is_clean() {
        let violations = check(&lab_definitions());
        assert!(violations.is_empty(), "{:?}", violations);
        assert!(gate(LintLevel::Warning).enforce(&violations).is_ok());
    }

    #[test]
    fn test_structural_rules() {
        let mut defs = lab_definitions();
        let nginx = &mut defs.site.roles[0];
        nginx.tasks[0].name = None;
        nginx.tasks[2].name = Some("render index".into());
        if let ResourceSpec::Template { dest, mode, .. } = &mut nginx.tasks[1].resource {
            *dest = "var/www/html/index.html".into();
            *mode = None;
        }
        nginx.handlers.push(Handler {
            name: "bounce".into(),
            action: HandlerAction::Command {
                cmd: "/usr/sbin/service".into(),
                args: vec!["nginx".into(), "restart".into()],
            },
        });
        defs.site.roles.push(role("orphan", &[]));

        let violations = check(&defs);
        let found = rules(&violations);
        for rule in [
            "task-name-missing",
            "task-name-duplicate",
            "path-not-absolute",
            "file-mode-missing",
            "handler-unused",
            "command-instead-of-module",
            "role-empty",
            "role-unused",
        ] {
            assert!(found.contains(&rule), "missing {} in {:?}", rule, found);
        }
    }

    #[test]
    fn test_short_mode_is_invalid() {
        let mut defs = lab_definitions();
        if let ResourceSpec::Template { mode, .. } = &mut defs.site.roles[0].tasks[1].resource {
            *mode = Some("44".into());
        }

        let violations = check(&defs);
        let invalid = violations
            .iter()
            .find(|v| v.rule == "file-mode-invalid")
            .unwrap();
        assert_eq!(invalid.level, LintLevel::Error);
        assert!(invalid.message.contains("'44'"));
        assert!(gate(LintLevel::Error).enforce(&violations).is_err());
    }

    #[test]
    fn test_inventory_rules() {
        let mut defs = lab_definitions();
        defs.inventory.groups.push(keel_core::domain::inventory::Group {
            name: "staging".into(),
            vars: Default::default(),
        });
        defs.site.plays.push(Play {
            name: Some("staging".into()),
            hosts: Selector::parse("staging").unwrap(),
            roles: vec!["nginx".into()],
        });

        let found = check(&defs);
        let group = found.iter().find(|v| v.rule == "group-empty").unwrap();
        assert_eq!(group.level, LintLevel::Info);
        assert!(rules(&found).contains(&"play-no-hosts"));
    }

    #[test]
    fn test_dry_run_reports_missing_template_and_variables() {
        let mut defs = lab_definitions().with_template("index.html.tmpl", "{{ greeting }} {{ motd }}");
        defs.site.roles[1].tasks.push(Task {
            name: Some("ghost".into()),
            resource: ResourceSpec::Template {
                src: "ghost.tmpl".into(),
                dest: "/etc/ghost".into(),
                mode: Some("0600".into()),
            },
            notify: vec![],
        });

        let violations = check(&defs);
        let undefined: Vec<_> = violations
            .iter()
            .filter(|v| v.rule == "undefined-variable")
            .collect();
        // One per tier node
        assert_eq!(undefined.len(), 2);
        assert!(undefined[0].message.contains("motd"));

        let missing: Vec<_> = violations
            .iter()
            .filter(|v| v.rule == "template-missing")
            .collect();
        assert_eq!(missing.len(), 1);

        let err = gate(LintLevel::Error).enforce(&violations).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_dry_run_reports_unknown_role_and_cycle() {
        let mut defs = lab_definitions();
        defs.site.plays[0].roles.push("postgres".into());
        defs.site.roles.push(role("a", &["b"]));
        defs.site.roles.push(role("b", &["a"]));
        defs.site.plays[1].roles.push("a".into());

        let violations = check(&defs);
        let found = rules(&violations);
        assert!(found.contains(&"unknown-role"));
        assert!(found.contains(&"dependency-cycle"));
    }

    #[test]
    fn test_min_level_decides_blocking() {
        let mut defs = lab_definitions();
        defs.site.roles[0].tasks[0].name = None;
        let violations = check(&defs);

        assert!(gate(LintLevel::Warning).enforce(&violations).is_err());
        assert!(gate(LintLevel::Error).enforce(&violations).is_ok());
    }
}
