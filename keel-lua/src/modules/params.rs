//! Parameters module for definition scripts
//!
//! Exposes the extra variables given on the command line (`--var key=value`)
//! to inventory and site files. Nothing is read from the process
//! environment: the caller decides what a script can see.

use crate::module::KeelModule;
use mlua::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Trait for providing parameters to scripts
pub trait VarProvider: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    fn keys(&self) -> Vec<String>;
}

/// Fixed set of parameters
#[derive(Debug, Default, Clone)]
pub struct StaticVars(BTreeMap<String, String>);

impl StaticVars {
    pub fn new(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(vars.into_iter().collect())
    }
}

impl VarProvider for StaticVars {
    fn get(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }
}

/// `params` global: `get`, `require`, `has`, `all`
pub struct ParamsModule<V: VarProvider> {
    provider: Arc<V>,
}

impl<V: VarProvider> ParamsModule<V> {
    pub fn new(provider: V) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }
}

impl<V: VarProvider + 'static> KeelModule for ParamsModule<V> {
    fn id(&self) -> &'static str {
        "params"
    }

    fn register(&self, lua: &Lua) -> LuaResult<()> {
        let params = lua.create_table()?;

        // params.get(name, default?)
        {
            let provider = self.provider.clone();
            params.set(
                "get",
                lua.create_function(move |_, (name, default): (String, Option<String>)| {
                    Ok(provider.get(&name).or(default))
                })?,
            )?;
        }

        // params.require(name)
        {
            let provider = self.provider.clone();
            params.set(
                "require",
                lua.create_function(move |_, name: String| {
                    provider.get(&name).ok_or_else(|| {
                        LuaError::RuntimeError(format!("Required parameter '{}' is not set", name))
                    })
                })?,
            )?;
        }

        // params.has(name)
        {
            let provider = self.provider.clone();
            params.set(
                "has",
                lua.create_function(move |_, name: String| Ok(provider.get(&name).is_some()))?,
            )?;
        }

        // params.all()
        {
            let provider = self.provider.clone();
            params.set(
                "all",
                lua.create_function(move |lua, ()| {
                    let table = lua.create_table()?;
                    for key in provider.keys() {
                        if let Some(value) = provider.get(&key) {
                            table.set(key, value)?;
                        }
                    }
                    Ok(table)
                })?,
            )?;
        }

        lua.globals().set(self.id(), params)?;
        Ok(())
    }

    fn stubs(&self) -> String {
        r#"---@meta

---Extra variables passed with --var key=value
---@class params
params = {}

---@param name string
---@param default? string
---@return string|nil
function params.get(name, default) end

---Errors when the parameter is missing
---@param name string
---@return string
function params.require(name) end

---@param name string
---@return boolean
function params.has(name) end

---@return table<string, string>
function params.all() end
"#
        .to_string()
    }
}
