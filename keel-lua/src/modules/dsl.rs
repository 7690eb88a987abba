//! The `keel` helper module
//!
//! Constructors that build the plain tables the parser reads. Definitions
//! may use them or write the tables by hand; both produce the same shape:
//!
//! ```lua
//! keel.task("install nginx", keel.package("nginx"))
//! -- is the same as
//! { name = "install nginx", package = { name = "nginx", state = "present" } }
//! ```

use crate::module::KeelModule;
use mlua::prelude::*;

pub struct DslModule;

/// Copies every field of `source` into `target`
fn merge_into(target: &LuaTable, source: &LuaTable) -> LuaResult<()> {
    for pair in source.pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        target.set(key, value)?;
    }
    Ok(())
}

/// Wraps `body` as `{ [kind] = body }`
fn resource(lua: &Lua, kind: &str, body: LuaTable) -> LuaResult<LuaTable> {
    let wrapper = lua.create_table()?;
    wrapper.set(kind, body)?;
    Ok(wrapper)
}

fn file_body(
    lua: &Lua,
    field: &str,
    value: String,
    dest: String,
    mode: Option<LuaValue>,
) -> LuaResult<LuaTable> {
    let body = lua.create_table()?;
    body.set(field, value)?;
    body.set("dest", dest)?;
    if let Some(mode) = mode {
        body.set("mode", mode)?;
    }
    Ok(body)
}

impl KeelModule for DslModule {
    fn id(&self) -> &'static str {
        "keel"
    }

    fn register(&self, lua: &Lua) -> LuaResult<()> {
        let keel = lua.create_table()?;

        // keel.define(t): returns the table as-is
        keel.set("define", lua.create_function(|_, t: LuaTable| Ok(t))?)?;

        // keel.package(name, state?)
        keel.set(
            "package",
            lua.create_function(|lua, (name, state): (String, Option<String>)| {
                let body = lua.create_table()?;
                body.set("name", name)?;
                body.set("state", state.unwrap_or_else(|| "present".to_string()))?;
                resource(lua, "package", body)
            })?,
        )?;

        // keel.template(src, dest, mode?)
        keel.set(
            "template",
            lua.create_function(
                |lua, (src, dest, mode): (String, String, Option<LuaValue>)| {
                    let body = file_body(lua, "src", src, dest, mode)?;
                    resource(lua, "template", body)
                },
            )?,
        )?;

        // keel.copy(content, dest, mode?)
        keel.set(
            "copy",
            lua.create_function(
                |lua, (content, dest, mode): (String, String, Option<LuaValue>)| {
                    let body = file_body(lua, "content", content, dest, mode)?;
                    resource(lua, "copy", body)
                },
            )?,
        )?;

        // keel.directory(path, mode?)
        keel.set(
            "directory",
            lua.create_function(|lua, (path, mode): (String, Option<LuaValue>)| {
                let body = lua.create_table()?;
                body.set("path", path)?;
                if let Some(mode) = mode {
                    body.set("mode", mode)?;
                }
                resource(lua, "directory", body)
            })?,
        )?;

        // keel.service(name, opts?) where opts = { state, enabled }
        keel.set(
            "service",
            lua.create_function(|lua, (name, opts): (String, Option<LuaTable>)| {
                let body = lua.create_table()?;
                if let Some(opts) = opts {
                    merge_into(&body, &opts)?;
                }
                body.set("name", name)?;
                resource(lua, "service", body)
            })?,
        )?;

        // keel.task(name, resource, opts?) where opts = { notify }
        keel.set(
            "task",
            lua.create_function(
                |lua, (name, res, opts): (String, LuaTable, Option<LuaTable>)| {
                    let task = lua.create_table()?;
                    merge_into(&task, &res)?;
                    if let Some(opts) = opts {
                        merge_into(&task, &opts)?;
                    }
                    task.set("name", name)?;
                    Ok(task)
                },
            )?,
        )?;

        // keel.restart(service) / keel.reload(service): handler actions
        for action in ["restart", "reload"] {
            keel.set(
                action,
                lua.create_function(move |lua, name: String| {
                    let body = lua.create_table()?;
                    body.set("name", name)?;
                    body.set("action", action)?;
                    resource(lua, "service", body)
                })?,
            )?;
        }

        // keel.command(cmd, args?)
        keel.set(
            "command",
            lua.create_function(|lua, (cmd, args): (String, Option<LuaTable>)| {
                let body = lua.create_table()?;
                body.set("cmd", cmd)?;
                body.set("args", args.unwrap_or(lua.create_table()?))?;
                resource(lua, "command", body)
            })?,
        )?;

        // keel.handler(name, action)
        keel.set(
            "handler",
            lua.create_function(|lua, (name, action): (String, LuaTable)| {
                let handler = lua.create_table()?;
                merge_into(&handler, &action)?;
                handler.set("name", name)?;
                Ok(handler)
            })?,
        )?;

        // keel.node(name, groups, opts?) where opts = { container, runtime, vars }
        keel.set(
            "node",
            lua.create_function(
                |lua, (name, groups, opts): (String, LuaValue, Option<LuaTable>)| {
                    let node = lua.create_table()?;
                    if let Some(opts) = opts {
                        merge_into(&node, &opts)?;
                    }
                    node.set("name", name)?;
                    node.set("groups", groups)?;
                    Ok(node)
                },
            )?,
        )?;

        // keel.group(name, vars?)
        keel.set(
            "group",
            lua.create_function(|lua, (name, vars): (String, Option<LuaTable>)| {
                let group = lua.create_table()?;
                group.set("name", name)?;
                if let Some(vars) = vars {
                    group.set("vars", vars)?;
                }
                Ok(group)
            })?,
        )?;

        // keel.probe(url, opts?) where opts = { name, expect_status, contains }
        keel.set(
            "probe",
            lua.create_function(|lua, (url, opts): (String, Option<LuaTable>)| {
                let probe = lua.create_table()?;
                if let Some(opts) = opts {
                    merge_into(&probe, &opts)?;
                }
                probe.set("url", url)?;
                Ok(probe)
            })?,
        )?;

        lua.globals().set(self.id(), keel)?;
        Ok(())
    }

    fn stubs(&self) -> String {
        r#"---@meta

---Helpers for inventory and site definitions
---@class keel
keel = {}

---@generic T
---@param definition T
---@return T
function keel.define(definition) end

---@param name string
---@param state? "present"|"absent"
---@return table
function keel.package(name, state) end

---Render templates/<src> to dest on the node
---@param src string
---@param dest string
---@param mode? string
---@return table
function keel.template(src, dest, mode) end

---@param content string
---@param dest string
---@param mode? string
---@return table
function keel.copy(content, dest, mode) end

---@param path string
---@param mode? string
---@return table
function keel.directory(path, mode) end

---@param name string
---@param opts? { state?: "started"|"stopped", enabled?: boolean }
---@return table
function keel.service(name, opts) end

---@param name string
---@param resource table
---@param opts? { notify?: string|string[] }
---@return table
function keel.task(name, resource, opts) end

---@param service string
---@return table
function keel.restart(service) end

---@param service string
---@return table
function keel.reload(service) end

---@param cmd string
---@param args? string[]
---@return table
function keel.command(cmd, args) end

---@param name string
---@param action table
---@return table
function keel.handler(name, action) end

---@param name string
---@param groups string|string[]
---@param opts? { container?: string, runtime?: "docker"|"podman", vars?: table }
---@return table
function keel.node(name, groups, opts) end

---@param name string
---@param vars? table
---@return table
function keel.group(name, vars) end

---@param url string
---@param opts? { name?: string, expect_status?: integer, contains?: string }
---@return table
function keel.probe(url, opts) end
"#
        .to_string()
    }
}
