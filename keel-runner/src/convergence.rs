//! Convergence engine
//!
//! Applies each node's plan: for every task run the check, apply on drift,
//! and queue the handlers a changed task notifies. Queued handlers fire once
//! each, in order of first notification, after the node's last task.
//!
//! A failing task aborts its node (fail-fast, no rollback, queued handlers
//! are dropped). Other nodes keep going; nodes run concurrently up to
//! `max_parallel_nodes`.

use keel_core::ResourceApplyError;
use keel_core::domain::role::HandlerAction;
use keel_core::domain::run::{ChangeStatus, NodeReport, TaskReport};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::connection::Connector;
use crate::context::RunContext;
use crate::host::Host;
use crate::plan::NodePlan;
use crate::resource::{self, TemplateSource};
use crate::template::TemplateRenderer;

/// Deferred handler notifications of one node, keyed by handler name
#[derive(Debug, Default)]
pub struct HandlerQueue {
    queued: Vec<String>,
}

impl HandlerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a handler; returns false if it was already queued
    pub fn notify(&mut self, handler: &str) -> bool {
        if self.queued.iter().any(|h| h == handler) {
            return false;
        }
        self.queued.push(handler.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Takes every queued handler name in first-notified order
    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.queued)
    }
}

/// Result of converging one node
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub report: NodeReport,
    pub failure: Option<ResourceApplyError>,
}

impl NodeOutcome {
    fn failed(mut report: NodeReport, task: &str, cause: String) -> Self {
        let failure = ResourceApplyError {
            node: report.node.clone(),
            task: task.to_string(),
            cause,
        };
        report.error = Some(failure.to_string());
        Self {
            report,
            failure: Some(failure),
        }
    }
}

/// Applies node plans through a connector
#[derive(Clone)]
pub struct ConvergenceEngine {
    connector: Arc<dyn Connector>,
    renderer: Arc<dyn TemplateRenderer>,
    semaphore: Arc<Semaphore>,
}

impl ConvergenceEngine {
    pub fn new(
        connector: Arc<dyn Connector>,
        renderer: Arc<dyn TemplateRenderer>,
        max_parallel_nodes: usize,
    ) -> Self {
        Self {
            connector,
            renderer,
            semaphore: Arc::new(Semaphore::new(max_parallel_nodes.max(1))),
        }
    }

    /// Converges every plan concurrently; outcomes keep plan order
    ///
    /// Dropping the returned future (stage timeout) aborts node tasks that
    /// are still running. Nothing they already applied is undone.
    pub async fn converge_all(
        &self,
        plans: Vec<NodePlan>,
        templates: Arc<dyn TemplateSource>,
        ctx: Arc<RunContext>,
    ) -> Vec<NodeOutcome> {
        let mut handles = Vec::new();
        let mut guard = AbortOnDrop::default();

        for plan in plans {
            let engine = self.clone();
            let templates = Arc::clone(&templates);
            let ctx = Arc::clone(&ctx);
            let name = plan.node.name.clone();

            let handle = tokio::spawn(async move {
                // Permit is released when the task ends
                let _permit = engine.semaphore.clone().acquire_owned().await.ok();
                let outcome = engine.converge_node(&plan, templates.as_ref()).await;
                match &outcome.failure {
                    None => ctx.log_info(format!(
                        "{}: {} changed, {} unchanged, handlers [{}]",
                        outcome.report.node,
                        outcome.report.changed(),
                        outcome.report.unchanged(),
                        outcome.report.handlers.join(", ")
                    )),
                    Some(failure) => ctx.log_error(failure.to_string()),
                }
                outcome
            });
            guard.0.push(handle.abort_handle());
            handles.push((name, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!("Convergence task for {} panicked: {}", name, e);
                    outcomes.push(NodeOutcome::failed(
                        NodeReport::new(name),
                        "convergence",
                        format!("task aborted: {}", e),
                    ));
                }
            }
        }
        outcomes
    }

    /// Converges a single node
    pub async fn converge_node(&self, plan: &NodePlan, templates: &dyn TemplateSource) -> NodeOutcome {
        let node = &plan.node.name;
        let report = NodeReport::new(node.clone());

        info!(node = %node, "Converging {} task(s)", plan.task_count());

        let host = match self.connector.connect(&plan.node).await {
            Ok(host) => host,
            Err(e) => return NodeOutcome::failed(report, "connect", format!("{:#}", e)),
        };

        if let Err(e) = host.ping().await {
            return NodeOutcome::failed(
                report,
                "pre-flight",
                format!("{} unreachable: {:#}", host.target(), e),
            );
        }

        self.apply_plan(plan, host.as_ref(), templates, report).await
    }

    async fn apply_plan(
        &self,
        plan: &NodePlan,
        host: &dyn Host,
        templates: &dyn TemplateSource,
        mut report: NodeReport,
    ) -> NodeOutcome {
        let node = &plan.node.name;
        let mut queue = HandlerQueue::new();

        for (role, task) in plan.tasks() {
            let label = task.label();

            let status = match resource::build(
                &task.resource,
                &plan.vars,
                templates,
                self.renderer.as_ref(),
            ) {
                Ok(resource) => resource::converge(resource.as_ref(), host).await,
                Err(e) => Err(e),
            };

            let status = match status {
                Ok(status) => status,
                Err(e) => return NodeOutcome::failed(report, &label, format!("{:#}", e)),
            };

            debug!(node = %node, role = %role.name, "{}: {:?}", label, status);

            if status == ChangeStatus::Changed {
                for handler in &task.notify {
                    if queue.notify(handler) {
                        debug!(node = %node, "Queued handler '{}'", handler);
                    }
                }
            }

            report.tasks.push(TaskReport {
                role: role.name.clone(),
                task: label,
                resource: task.resource.describe(),
                status,
            });
        }

        for name in queue.drain() {
            let task = format!("handler '{}'", name);
            let Some(handler) = plan.handler(&name) else {
                return NodeOutcome::failed(report, &task, "no role declares this handler".into());
            };

            if let Err(e) = run_handler(host, &handler.action).await {
                return NodeOutcome::failed(report, &task, format!("{:#}", e));
            }
            info!(node = %node, "Handler '{}' fired", name);
            report.handlers.push(name);
        }

        NodeOutcome {
            report,
            failure: None,
        }
    }
}

#[derive(Default)]
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

async fn run_handler(host: &dyn Host, action: &HandlerAction) -> anyhow::Result<()> {
    match action {
        HandlerAction::Service { name, action } => host.service_action(name, *action).await,
        HandlerAction::Command { cmd, args } => host.run_command(cmd, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::resolve;
    use crate::template::PlaceholderRenderer;
    use crate::testing::{INDEX_PATH, MemoryConnector, lab_definitions};
    use keel_core::domain::role::{ResourceSpec, Task};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn engine(connector: &MemoryConnector) -> ConvergenceEngine {
        ConvergenceEngine::new(
            Arc::new(connector.clone()),
            Arc::new(PlaceholderRenderer),
            2,
        )
    }

    fn plans(defs: &crate::definitions::Definitions) -> Vec<NodePlan> {
        let resolved = resolve(&defs.inventory, &defs.site, &BTreeMap::new()).unwrap();
        resolved
            .nodes
            .iter()
            .map(|n| NodePlan::build(&defs.site, n).unwrap())
            .collect()
    }

    async fn run(
        connector: &MemoryConnector,
        defs: crate::definitions::Definitions,
    ) -> Vec<NodeOutcome> {
        let plans = plans(&defs);
        engine(connector)
            .converge_all(plans, Arc::new(defs), RunContext::new(Uuid::new_v4()))
            .await
    }

    #[test]
    fn test_handler_queue_dedupes_in_first_notified_order() {
        let mut queue = HandlerQueue::new();
        assert!(queue.notify("reload nginx"));
        assert!(queue.notify("restart nginx"));
        assert!(!queue.notify("reload nginx"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.drain(), vec!["reload nginx", "restart nginx"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_tier_nodes_render_greeting_edge_untouched() {
        let connector = MemoryConnector::default();
        let outcomes = run(&connector, lab_definitions()).await;

        assert!(outcomes.iter().all(|o| o.failure.is_none()));

        let web1 = connector.host("web1").file(INDEX_PATH).unwrap();
        let web2 = connector.host("web2").file(INDEX_PATH).unwrap();
        assert_eq!(web1, web2);
        assert!(web1.contains("hello"));

        let lb = outcomes.iter().find(|o| o.report.node == "lb").unwrap();
        assert!(lb.report.tasks.iter().all(|t| !t.resource.contains(INDEX_PATH)));
        assert_eq!(connector.host("lb").file(INDEX_PATH), None);
    }

    #[tokio::test]
    async fn test_second_run_is_unchanged_and_fires_no_handlers() {
        let connector = MemoryConnector::default();

        let first = run(&connector, lab_definitions()).await;
        let web1 = first.iter().find(|o| o.report.node == "web1").unwrap();
        assert_eq!(web1.report.changed(), 3);
        assert_eq!(web1.report.handlers, vec!["restart nginx"]);

        let second = run(&connector, lab_definitions()).await;
        for outcome in &second {
            assert_eq!(outcome.report.changed(), 0, "{}", outcome.report.node);
            assert!(outcome.report.handlers.is_empty());
        }
        assert_eq!(connector.host("web1").actions(), vec!["restart nginx"]);
    }

    #[tokio::test]
    async fn test_handler_notified_twice_fires_once() {
        let mut defs = lab_definitions();
        let nginx = defs.site.roles.iter_mut().find(|r| r.name == "nginx").unwrap();
        nginx.tasks.push(Task {
            name: Some("extra conf".into()),
            resource: ResourceSpec::Copy {
                content: "gzip on;".into(),
                dest: "/etc/nginx/conf.d/gzip.conf".into(),
                mode: Some("0644".into()),
            },
            notify: vec!["restart nginx".into()],
        });

        let connector = MemoryConnector::default();
        run(&connector, defs).await;
        assert_eq!(connector.host("web1").actions(), vec!["restart nginx"]);
    }

    #[tokio::test]
    async fn test_handler_shared_by_two_roles_fires_once() {
        let mut defs = lab_definitions();

        let mut php = crate::testing::role("php", &[]);
        php.tasks.push(Task {
            name: Some("php upstream".into()),
            resource: ResourceSpec::Copy {
                content: "upstream php { server 127.0.0.1:9000; }".into(),
                dest: "/etc/nginx/conf.d/php.conf".into(),
                mode: Some("0644".into()),
            },
            notify: vec!["restart nginx".into()],
        });
        php.handlers.push(keel_core::domain::role::Handler {
            name: "restart nginx".into(),
            action: HandlerAction::Command {
                cmd: "nginx".into(),
                args: vec!["-s".into(), "reload".into()],
            },
        });
        defs.site.roles.push(php);
        defs.site.plays[0].roles.push("php".into());

        let connector = MemoryConnector::default();
        let outcomes = run(&connector, defs).await;

        let web1 = outcomes.iter().find(|o| o.report.node == "web1").unwrap();
        assert!(web1.failure.is_none());
        assert_eq!(web1.report.handlers, vec!["restart nginx"]);
        // nginx comes first in the plan, so its declaration is the one fired
        assert_eq!(connector.host("web1").actions(), vec!["restart nginx"]);
    }

    #[tokio::test]
    async fn test_failure_is_fail_fast_without_handlers() {
        let connector = MemoryConnector::default();
        connector.host("web2").fail_writes_to(INDEX_PATH);

        let outcomes = run(&connector, lab_definitions()).await;

        let web2 = outcomes.iter().find(|o| o.report.node == "web2").unwrap();
        let failure = web2.failure.as_ref().unwrap();
        assert_eq!(failure.node, "web2");
        assert_eq!(failure.task, "render index");
        assert!(failure.cause.contains("read-only"));

        // Package task ran, service task never did, handler dropped
        assert_eq!(web2.report.tasks.len(), 1);
        assert!(connector.host("web2").actions().is_empty());

        // Other nodes finished
        let web1 = outcomes.iter().find(|o| o.report.node == "web1").unwrap();
        assert!(web1.failure.is_none());
        assert_eq!(web1.report.tasks.len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_preflight() {
        let connector = MemoryConnector::default();
        connector.host("lb").set_unreachable();

        let outcomes = run(&connector, lab_definitions()).await;
        let lb = outcomes.iter().find(|o| o.report.node == "lb").unwrap();
        assert_eq!(lb.failure.as_ref().unwrap().task, "pre-flight");
        assert!(lb.report.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_command_handler() {
        let mut defs = lab_definitions();
        let nginx = defs.site.roles.iter_mut().find(|r| r.name == "nginx").unwrap();
        nginx.handlers[0].action = HandlerAction::Command {
            cmd: "nginx".into(),
            args: vec!["-s".into(), "reload".into()],
        };

        let connector = MemoryConnector::default();
        run(&connector, defs).await;
        assert_eq!(connector.host("web1").actions(), vec!["nginx -s reload"]);
    }
}
