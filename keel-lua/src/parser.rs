//! Definition parser
//!
//! Evaluates inventory and site files in the sandbox and converts the
//! returned tables into domain types. Evaluation is the only thing a
//! definition does: no resource is checked or applied here.

use anyhow::{Context, Result, anyhow, bail};
use keel_core::domain::Vars;
use keel_core::domain::inventory::{Connection, ContainerRuntime, Group, Inventory, Node};
use keel_core::domain::probe::ProbeSpec;
use keel_core::domain::role::{
    Handler, HandlerAction, PackageState, Play, ResourceSpec, Role, ServiceAction, ServiceState,
    Site, Task,
};
use keel_core::domain::selector::Selector;
use mlua::{Lua, Table, Value};

use crate::modules::StaticVars;
use crate::sandbox::{create_sandbox, definition_registry};

const RESOURCE_KINDS: [&str; 5] = ["package", "template", "copy", "directory", "service"];
const HANDLER_KINDS: [&str; 2] = ["service", "command"];

/// Parse an inventory definition
///
/// ```no_run
/// use keel_lua::parser::parse_inventory;
/// use keel_lua::StaticVars;
///
/// let source = r#"
///     return {
///         vars = { http_port = 80 },
///         groups = {
///             { name = "tier", vars = { greeting = "hello" } },
///             { name = "edge" },
///         },
///         nodes = {
///             { name = "web1", groups = "tier", container = "lab-web1" },
///             { name = "lb", groups = { "edge" } },
///         },
///     }
/// "#;
///
/// let inventory = parse_inventory(source, "inventory.lua", StaticVars::default())?;
/// assert_eq!(inventory.nodes.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn parse_inventory(source: &str, chunk_name: &str, params: StaticVars) -> Result<Inventory> {
    let (_lua, root) = evaluate(source, chunk_name, params)?;

    let default_runtime = match opt_string(&root, "runtime")? {
        Some(runtime) => runtime.parse::<ContainerRuntime>().map_err(|e| anyhow!(e))?,
        None => ContainerRuntime::default(),
    };

    let vars = parse_vars(&root, "vars").context("Invalid inventory 'vars'")?;

    let mut groups = Vec::new();
    for (idx, value) in sequence(&root, "groups")?.into_iter().enumerate() {
        let group = match value {
            Value::String(name) => Group {
                name: name.to_str()?.to_string(),
                vars: Vars::new(),
            },
            Value::Table(table) => Group {
                name: get_string(&table, "name")
                    .with_context(|| format!("Group #{} must have a 'name'", idx + 1))?,
                vars: parse_vars(&table, "vars")?,
            },
            _ => bail!("Group #{} must be a table or a name", idx + 1),
        };
        groups.push(group);
    }

    let mut nodes = Vec::new();
    for (idx, value) in sequence(&root, "nodes")?.into_iter().enumerate() {
        let Value::Table(table) = value else {
            bail!("Node #{} must be a table", idx + 1);
        };
        let name = get_string(&table, "name")
            .with_context(|| format!("Node #{} must have a 'name'", idx + 1))?;
        nodes.push(parse_node(&table, name, default_runtime)?);
    }

    Ok(Inventory {
        vars,
        groups,
        nodes,
    })
}

fn parse_node(table: &Table, name: String, default_runtime: ContainerRuntime) -> Result<Node> {
    let runtime = match opt_string(table, "runtime")? {
        Some(runtime) => runtime
            .parse::<ContainerRuntime>()
            .map_err(|e| anyhow!("Node '{}': {}", name, e))?,
        None => default_runtime,
    };

    let container = opt_string(table, "container")?.unwrap_or_else(|| name.clone());
    let groups = string_list(table, "groups").with_context(|| format!("Node '{}'", name))?;
    let vars = parse_vars(table, "vars").with_context(|| format!("Node '{}'", name))?;

    Ok(Node {
        name,
        groups,
        connection: Connection { runtime, container },
        vars,
    })
}

/// Parse a site definition (roles, plays, probes)
pub fn parse_site(source: &str, chunk_name: &str, params: StaticVars) -> Result<Site> {
    let (_lua, root) = evaluate(source, chunk_name, params)?;

    let name: String = get_string(&root, "name").context("Site must have a 'name' field")?;
    let description = opt_string(&root, "description")?;

    let roles = parse_roles(&root)?;

    let mut plays = Vec::new();
    for (idx, value) in sequence(&root, "plays")?.into_iter().enumerate() {
        let Value::Table(table) = value else {
            bail!("Play #{} must be a table", idx + 1);
        };
        plays.push(parse_play(&table).with_context(|| format!("Invalid play #{}", idx + 1))?);
    }

    let mut probes = Vec::new();
    for (idx, value) in sequence(&root, "verify")?.into_iter().enumerate() {
        let probe = match value {
            Value::String(url) => ProbeSpec::new(url.to_str()?.to_string()),
            Value::Table(table) => {
                parse_probe(&table).with_context(|| format!("Invalid probe #{}", idx + 1))?
            }
            _ => bail!("Probe #{} must be a table or a URL", idx + 1),
        };
        probes.push(probe);
    }

    Ok(Site {
        name,
        description,
        roles,
        plays,
        probes,
    })
}

/// Roles may be an array of named tables, or a map keyed by role name
fn parse_roles(root: &Table) -> Result<Vec<Role>> {
    let roles_value: Value = root.get("roles")?;

    let mut roles = Vec::new();
    match roles_value {
        Value::Nil => {}
        Value::Table(table) if table.raw_len() > 0 => {
            for (idx, entry) in table.sequence_values::<Table>().enumerate() {
                let entry = entry.with_context(|| format!("Role #{} must be a table", idx + 1))?;
                let name = get_string(&entry, "name")
                    .with_context(|| format!("Role #{} must have a 'name'", idx + 1))?;
                roles.push(parse_role(&entry, name)?);
            }
        }
        Value::Table(table) => {
            for pair in table.pairs::<String, Table>() {
                let (name, entry) = pair.context("Roles map must be name -> table")?;
                roles.push(parse_role(&entry, name)?);
            }
            roles.sort_by(|a, b| a.name.cmp(&b.name));
        }
        _ => bail!("Field 'roles' must be a table"),
    }

    Ok(roles)
}

fn parse_role(table: &Table, name: String) -> Result<Role> {
    let depends = string_list(table, "depends").with_context(|| format!("Role '{}'", name))?;
    let defaults = parse_vars(table, "defaults").with_context(|| format!("Role '{}'", name))?;

    let mut tasks = Vec::new();
    for (idx, value) in sequence(table, "tasks")?.into_iter().enumerate() {
        let Value::Table(task) = value else {
            bail!("Role '{}': task #{} must be a table", name, idx + 1);
        };
        tasks.push(
            parse_task(&task).with_context(|| format!("Role '{}': task #{}", name, idx + 1))?,
        );
    }

    let mut handlers = Vec::new();
    for (idx, value) in sequence(table, "handlers")?.into_iter().enumerate() {
        let Value::Table(handler) = value else {
            bail!("Role '{}': handler #{} must be a table", name, idx + 1);
        };
        handlers.push(
            parse_handler(&handler)
                .with_context(|| format!("Role '{}': handler #{}", name, idx + 1))?,
        );
    }

    Ok(Role {
        name,
        depends,
        defaults,
        tasks,
        handlers,
    })
}

fn parse_task(table: &Table) -> Result<Task> {
    let name = opt_string(table, "name")?;
    let (kind, value) = single_key(table, &RESOURCE_KINDS, "resource")?;
    let resource = parse_resource(kind, value)?;
    let notify = string_list(table, "notify")?;

    Ok(Task {
        name,
        resource,
        notify,
    })
}

fn parse_resource(kind: &str, value: Value) -> Result<ResourceSpec> {
    // String shorthand: package = "nginx", service = "nginx", directory = "/srv"
    if let Value::String(s) = &value {
        let target = s.to_str()?.to_string();
        return match kind {
            "package" => Ok(ResourceSpec::Package {
                name: target,
                state: PackageState::Present,
            }),
            "service" => Ok(ResourceSpec::Service {
                name: target,
                state: ServiceState::Started,
                enabled: None,
            }),
            "directory" => Ok(ResourceSpec::Directory {
                path: target,
                mode: None,
            }),
            _ => bail!("Resource '{}' must be a table", kind),
        };
    }

    let Value::Table(body) = value else {
        bail!("Resource '{}' must be a table", kind);
    };

    let spec = match kind {
        "package" => ResourceSpec::Package {
            name: get_string(&body, "name").context("package needs 'name'")?,
            state: match opt_string(&body, "state")?.as_deref() {
                None | Some("present") | Some("installed") => PackageState::Present,
                Some("absent") | Some("removed") => PackageState::Absent,
                Some(other) => bail!("Unknown package state '{}'", other),
            },
        },
        "template" => ResourceSpec::Template {
            src: get_string(&body, "src").context("template needs 'src'")?,
            dest: get_string(&body, "dest").context("template needs 'dest'")?,
            mode: parse_mode(&body)?,
        },
        "copy" => ResourceSpec::Copy {
            content: get_string(&body, "content").context("copy needs 'content'")?,
            dest: get_string(&body, "dest").context("copy needs 'dest'")?,
            mode: parse_mode(&body)?,
        },
        "directory" => ResourceSpec::Directory {
            path: get_string(&body, "path").context("directory needs 'path'")?,
            mode: parse_mode(&body)?,
        },
        "service" => ResourceSpec::Service {
            name: get_string(&body, "name").context("service needs 'name'")?,
            state: match opt_string(&body, "state")?.as_deref() {
                None | Some("started") | Some("running") => ServiceState::Started,
                Some("stopped") => ServiceState::Stopped,
                Some(other) => bail!("Unknown service state '{}'", other),
            },
            enabled: opt_bool(&body, "enabled")?,
        },
        other => bail!("Unknown resource kind '{}'", other),
    };

    Ok(spec)
}

fn parse_handler(table: &Table) -> Result<Handler> {
    let name = get_string(table, "name").context("Handler must have a 'name'")?;
    let (kind, value) = single_key(table, &HANDLER_KINDS, "action")?;

    let action = match (kind, value) {
        ("service", Value::Table(body)) => HandlerAction::Service {
            name: get_string(&body, "name").context("service handler needs 'name'")?,
            action: match opt_string(&body, "action")?.as_deref() {
                None | Some("restart") | Some("restarted") => ServiceAction::Restart,
                Some("reload") | Some("reloaded") => ServiceAction::Reload,
                Some(other) => bail!("Unknown service action '{}'", other),
            },
        },
        ("command", Value::String(cmd)) => HandlerAction::Command {
            cmd: cmd.to_str()?.to_string(),
            args: Vec::new(),
        },
        ("command", Value::Table(body)) => HandlerAction::Command {
            cmd: get_string(&body, "cmd").context("command handler needs 'cmd'")?,
            args: string_list(&body, "args")?,
        },
        (kind, _) => bail!("Handler '{}': '{}' must be a table", name, kind),
    };

    Ok(Handler { name, action })
}

fn parse_play(table: &Table) -> Result<Play> {
    let name = opt_string(table, "name")?;
    let patterns = string_list(table, "hosts")?;
    if patterns.is_empty() {
        bail!("Play must have 'hosts'");
    }
    let hosts = Selector::from_patterns(&patterns).map_err(|e| anyhow!(e))?;
    let roles = string_list(table, "roles")?;

    Ok(Play { name, hosts, roles })
}

fn parse_probe(table: &Table) -> Result<ProbeSpec> {
    let expect_status = match table.get::<Value>("expect_status")? {
        Value::Nil => None,
        Value::Integer(code) => Some(
            u16::try_from(code).map_err(|_| anyhow!("Invalid status code {}", code))?,
        ),
        _ => bail!("'expect_status' must be an integer"),
    };

    Ok(ProbeSpec {
        name: opt_string(table, "name")?,
        url: get_string(table, "url").context("Probe must have a 'url'")?,
        expect_status,
        contains: opt_string(table, "contains")?,
    })
}

/// Evaluates a definition chunk; it must return a table
fn evaluate(source: &str, chunk_name: &str, params: StaticVars) -> Result<(Lua, Table)> {
    let registry = definition_registry(chunk_name, params);
    let lua = create_sandbox(&registry).context("Failed to create definition sandbox")?;

    let root: Table = lua
        .load(source)
        .set_name(format!("@{}", chunk_name))
        .eval()
        .with_context(|| format!("Failed to evaluate {}", chunk_name))?;

    Ok((lua, root))
}

/// Finds the one field of `table` whose name is in `kinds`
fn single_key(table: &Table, kinds: &[&'static str], what: &str) -> Result<(&'static str, Value)> {
    let mut found = None;
    for kind in kinds {
        let value: Value = table.get(*kind)?;
        if value.is_nil() {
            continue;
        }
        if let Some((previous, _)) = found {
            bail!("Only one {} allowed, found '{}' and '{}'", what, previous, kind);
        }
        found = Some((*kind, value));
    }
    found.ok_or_else(|| anyhow!("Missing {}: expected one of {}", what, kinds.join(", ")))
}

fn get_string(table: &Table, key: &str) -> Result<String> {
    opt_string(table, key)?.ok_or_else(|| anyhow!("Missing '{}' field", key))
}

fn opt_string(table: &Table, key: &str) -> Result<Option<String>> {
    match table.get::<Value>(key)? {
        Value::Nil => Ok(None),
        Value::String(s) => Ok(Some(s.to_str()?.to_string())),
        _ => bail!("Field '{}' must be a string", key),
    }
}

fn opt_bool(table: &Table, key: &str) -> Result<Option<bool>> {
    match table.get::<Value>(key)? {
        Value::Nil => Ok(None),
        Value::Boolean(b) => Ok(Some(b)),
        _ => bail!("Field '{}' must be a boolean", key),
    }
}

/// File modes may be written as "0644" or 644
fn parse_mode(table: &Table) -> Result<Option<String>> {
    match table.get::<Value>("mode")? {
        Value::Nil => Ok(None),
        Value::String(s) => Ok(Some(s.to_str()?.to_string())),
        Value::Integer(i) => Ok(Some(i.to_string())),
        _ => bail!("Field 'mode' must be a string such as \"0644\""),
    }
}

/// A string or an array of strings
fn string_list(table: &Table, key: &str) -> Result<Vec<String>> {
    match table.get::<Value>(key)? {
        Value::Nil => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.to_str()?.to_string()]),
        Value::Table(list) => {
            let mut values = Vec::new();
            for item in list.sequence_values::<String>() {
                values.push(item.with_context(|| format!("Field '{}' must hold strings", key))?);
            }
            Ok(values)
        }
        _ => bail!("Field '{}' must be a string or an array of strings", key),
    }
}

/// An array whose order matters; map-shaped tables are rejected
fn sequence(table: &Table, key: &str) -> Result<Vec<Value>> {
    match table.get::<Value>(key)? {
        Value::Nil => Ok(Vec::new()),
        Value::Table(list) => {
            let len = list.raw_len();
            let entries = list.pairs::<Value, Value>().count();
            if entries != len {
                bail!("Field '{}' must be an array (declaration order matters)", key);
            }
            list.sequence_values::<Value>()
                .collect::<mlua::Result<Vec<_>>>()
                .with_context(|| format!("Failed to read '{}'", key))
        }
        _ => bail!("Field '{}' must be an array", key),
    }
}

fn parse_vars(table: &Table, key: &str) -> Result<Vars> {
    match table.get::<Value>(key)? {
        Value::Nil => Ok(Vars::new()),
        Value::Table(vars) => {
            let mut out = Vars::new();
            for pair in vars.pairs::<String, Value>() {
                let (name, value) =
                    pair.with_context(|| format!("Variable names in '{}' must be strings", key))?;
                let json = lua_value_to_json(&value)
                    .with_context(|| format!("Variable '{}' has an unsupported value", name))?;
                out.insert(name, json);
            }
            Ok(out)
        }
        _ => bail!("Field '{}' must be a table", key),
    }
}

/// Convert a Lua value to JSON; arrays stay arrays, other tables become objects
fn lua_value_to_json(val: &Value) -> Result<serde_json::Value> {
    match val {
        Value::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| anyhow!("Invalid number value")),
        Value::Integer(i) => Ok(serde_json::Value::Number((*i).into())),
        Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Table(table) => {
            let len = table.raw_len();
            if len > 0 && table.pairs::<Value, Value>().count() == len {
                let items = table
                    .sequence_values::<Value>()
                    .map(|v| lua_value_to_json(&v?))
                    .collect::<Result<Vec<_>>>()?;
                Ok(serde_json::Value::Array(items))
            } else {
                let mut object = serde_json::Map::new();
                for pair in table.pairs::<String, Value>() {
                    let (key, value) = pair.context("Object keys must be strings")?;
                    object.insert(key, lua_value_to_json(&value)?);
                }
                Ok(serde_json::Value::Object(object))
            }
        }
        _ => Err(anyhow!("Unsupported Lua value type for JSON conversion")),
    }
}
