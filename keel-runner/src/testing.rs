//! Test fixtures: an in-memory host and a small two-tier lab

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use keel_core::domain::Vars;
use keel_core::domain::inventory::{Connection, ContainerRuntime, Group, Inventory, Node};
use keel_core::domain::role::{
    Handler, HandlerAction, PackageState, Play, ResourceSpec, Role, ServiceAction, ServiceState,
    Site, Task,
};
use keel_core::domain::selector::Selector;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::connection::Connector;
use crate::definitions::Definitions;
use crate::host::Host;

pub const INDEX_TEMPLATE: &str = "<h1>{{ greeting }}</h1>\n";
pub const INDEX_PATH: &str = "/var/www/html/index.html";

#[derive(Debug, Default)]
pub struct HostState {
    pub packages: BTreeSet<String>,
    pub files: BTreeMap<String, (String, String)>,
    pub dirs: BTreeMap<String, String>,
    pub services: BTreeMap<String, (bool, bool)>,

    /// Handler side effects, e.g. `restart nginx`
    pub actions: Vec<String>,
    pub writes: usize,

    pub fail_writes_to: Option<String>,
    pub unreachable: bool,
}

/// Host whose state lives in memory; clones share state
#[derive(Clone, Default)]
pub struct MemoryHost {
    name: String,
    state: Arc<Mutex<HostState>>,
}

impl MemoryHost {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::default(),
        }
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).map(|f| f.0.clone())
    }

    pub fn mode(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).map(|f| f.1.clone())
    }

    pub fn put_file(&self, path: &str, content: &str, mode: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), (content.to_string(), mode.to_string()));
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn actions(&self) -> Vec<String> {
        self.state.lock().unwrap().actions.clone()
    }

    pub fn fail_writes_to(&self, path: &str) {
        self.state.lock().unwrap().fail_writes_to = Some(path.to_string());
    }

    pub fn set_unreachable(&self) {
        self.state.lock().unwrap().unreachable = true;
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn target(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn ping(&self) -> Result<()> {
        if self.state.lock().unwrap().unreachable {
            bail!("container {} is not running", self.name);
        }
        Ok(())
    }

    async fn package_installed(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().packages.contains(name))
    }

    async fn install_package(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().packages.insert(name.to_string());
        Ok(())
    }

    async fn remove_package(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().packages.remove(name);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        Ok(self.file(path))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes_to.as_deref() == Some(path) {
            bail!("{}: read-only file system", path);
        }
        state.writes += 1;
        let mode = state
            .files
            .get(path)
            .map(|f| f.1.clone())
            .unwrap_or_else(|| "644".to_string());
        state
            .files
            .insert(path.to_string(), (content.to_string(), mode));
        Ok(())
    }

    async fn file_mode(&self, path: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .get(path)
            .map(|f| f.1.clone())
            .or_else(|| state.dirs.get(path).cloned()))
    }

    async fn set_mode(&self, path: &str, mode: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mode = crate::resource::normalize_mode(mode);
        if let Some(file) = state.files.get_mut(path) {
            file.1 = mode;
        } else if let Some(dir) = state.dirs.get_mut(path) {
            *dir = mode;
        } else {
            bail!("chmod: cannot access '{}'", path);
        }
        Ok(())
    }

    async fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().dirs.contains_key(path))
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .dirs
            .insert(path.to_string(), "755".to_string());
        Ok(())
    }

    async fn service_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .services
            .get(name)
            .map(|s| s.0)
            .unwrap_or(false))
    }

    async fn set_service_running(&self, name: &str, running: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.services.entry(name.to_string()).or_default().0 = running;
        Ok(())
    }

    async fn service_enabled(&self, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .services
            .get(name)
            .map(|s| s.1)
            .unwrap_or(false))
    }

    async fn set_service_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.services.entry(name.to_string()).or_default().1 = enabled;
        Ok(())
    }

    async fn service_action(&self, name: &str, action: ServiceAction) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .actions
            .push(format!("{} {}", action, name));
        Ok(())
    }

    async fn run_command(&self, cmd: &str, args: &[String]) -> Result<()> {
        let mut line = vec![cmd.to_string()];
        line.extend(args.iter().cloned());
        self.state.lock().unwrap().actions.push(line.join(" "));
        Ok(())
    }
}

/// Hands out in-memory hosts by node name
#[derive(Clone, Default)]
pub struct MemoryConnector {
    hosts: Arc<Mutex<HashMap<String, MemoryHost>>>,
}

impl MemoryConnector {
    /// Host of a node, created on first use
    pub fn host(&self, node: &str) -> MemoryHost {
        self.hosts
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_insert_with(|| MemoryHost::new(node))
            .clone()
    }

    pub fn connected(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, node: &Node) -> Result<Box<dyn Host>> {
        if node.connection.container.is_empty() {
            return Err(anyhow!("node {} has no container", node.name));
        }
        Ok(Box::new(self.host(&node.name)))
    }
}

pub fn node(name: &str, groups: &[&str]) -> Node {
    Node {
        name: name.to_string(),
        groups: groups.iter().map(|g| g.to_string()).collect(),
        connection: Connection {
            runtime: ContainerRuntime::Docker,
            container: format!("lab-{}", name),
        },
        vars: Vars::new(),
    }
}

pub fn role(name: &str, depends: &[&str]) -> Role {
    Role {
        name: name.to_string(),
        depends: depends.iter().map(|d| d.to_string()).collect(),
        defaults: Vars::new(),
        tasks: Vec::new(),
        handlers: Vec::new(),
    }
}

fn task(name: &str, resource: ResourceSpec, notify: &[&str]) -> Task {
    Task {
        name: Some(name.to_string()),
        resource,
        notify: notify.iter().map(|n| n.to_string()).collect(),
    }
}

/// Two tier nodes greeting "hello", one edge node
pub fn lab_inventory() -> Inventory {
    Inventory {
        vars: [("http_port".to_string(), json!(80))].into(),
        groups: vec![
            Group {
                name: "tier".to_string(),
                vars: [("greeting".to_string(), json!("hello"))].into(),
            },
            Group {
                name: "edge".to_string(),
                vars: Vars::new(),
            },
        ],
        nodes: vec![
            node("web1", &["tier"]),
            node("web2", &["tier"]),
            node("lb", &["edge"]),
        ],
    }
}

/// nginx on the tier, haproxy on the edge
pub fn lab_site() -> Site {
    let mut nginx = role("nginx", &[]);
    nginx.tasks = vec![
        task(
            "install nginx",
            ResourceSpec::Package {
                name: "nginx".into(),
                state: PackageState::Present,
            },
            &[],
        ),
        task(
            "render index",
            ResourceSpec::Template {
                src: "index.html.tmpl".into(),
                dest: INDEX_PATH.into(),
                mode: Some("0644".into()),
            },
            &["restart nginx"],
        ),
        task(
            "nginx running",
            ResourceSpec::Service {
                name: "nginx".into(),
                state: ServiceState::Started,
                enabled: None,
            },
            &[],
        ),
    ];
    nginx.handlers = vec![Handler {
        name: "restart nginx".into(),
        action: HandlerAction::Service {
            name: "nginx".into(),
            action: ServiceAction::Restart,
        },
    }];

    let mut haproxy = role("haproxy", &[]);
    haproxy.tasks = vec![
        task(
            "install haproxy",
            ResourceSpec::Package {
                name: "haproxy".into(),
                state: PackageState::Present,
            },
            &[],
        ),
        task(
            "haproxy config",
            ResourceSpec::Copy {
                content: "frontend http\n  bind *:{{ http_port }}\n".into(),
                dest: "/etc/haproxy/haproxy.cfg".into(),
                mode: Some("0644".into()),
            },
            &["reload haproxy"],
        ),
    ];
    haproxy.handlers = vec![Handler {
        name: "reload haproxy".into(),
        action: HandlerAction::Service {
            name: "haproxy".into(),
            action: ServiceAction::Reload,
        },
    }];

    Site {
        name: "lab".into(),
        description: None,
        roles: vec![nginx, haproxy],
        plays: vec![
            Play {
                name: Some("web tier".into()),
                hosts: Selector::parse("tier").unwrap(),
                roles: vec!["nginx".into()],
            },
            Play {
                name: Some("edge".into()),
                hosts: Selector::parse("edge").unwrap(),
                roles: vec!["haproxy".into()],
            },
        ],
        probes: Vec::new(),
    }
}

pub fn lab_definitions() -> Definitions {
    Definitions::new(lab_site(), lab_inventory()).with_template("index.html.tmpl", INDEX_TEMPLATE)
}
