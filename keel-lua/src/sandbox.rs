//! Lua sandbox creation
//!
//! Definitions are evaluated in a restricted Lua state: only the table,
//! string, math and utf8 libraries are loaded, and the loaders that could
//! reach the filesystem are removed. Definition scripts therefore cannot do
//! I/O, spawn processes or read the environment; everything they see comes
//! from the modules the caller registers.

use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib};

use crate::module::ModuleRegistry;
use crate::modules::{DslModule, LogModule, ParamsModule, StaticVars, TracingLogSink};

/// Create a restricted Lua sandbox with the given modules registered
///
/// # Security
/// This sandbox prevents:
/// - File system access (`io`, `dofile`, `loadfile`)
/// - Process execution and environment access (`os`)
/// - Loading external modules via `require()`
pub fn create_sandbox(registry: &ModuleRegistry) -> LuaResult<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )?;

    let globals = lua.globals();
    globals.set("require", mlua::Nil)?;
    globals.set("dofile", mlua::Nil)?;
    globals.set("loadfile", mlua::Nil)?;

    registry.register_all(&lua)?;

    Ok(lua)
}

/// Registry used to evaluate definition files
///
/// # Arguments
/// * `source` - Definition file name, attached to log messages
/// * `params` - Extra variables exposed through the `params` module
pub fn definition_registry(source: &str, params: StaticVars) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(DslModule);
    registry.register(LogModule::new(TracingLogSink::new(source)));
    registry.register(ParamsModule::new(params));
    registry
}
