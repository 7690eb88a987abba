use mlua::prelude::*;

/// Trait for Lua modules available to definition scripts.
///
/// Each module registers one global table (named by `id()`) into the
/// sandbox and can describe itself to the Lua language server through
/// `stubs()`, which `keel init` writes to disk.
pub trait KeelModule: Send + Sync {
    /// Global variable name of the module in Lua.
    ///
    /// Must be a valid, unique, lowercase Lua identifier.
    fn id(&self) -> &'static str;

    /// Registers this module's functions into the Lua context.
    fn register(&self, lua: &Lua) -> LuaResult<()>;

    /// Lua language server stubs; starts with `---@meta`.
    fn stubs(&self) -> String;
}

/// Ordered set of modules to load into a sandbox
pub struct ModuleRegistry {
    modules: Vec<Box<dyn KeelModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Registers a module
    ///
    /// # Panics
    /// Panics if a module with the same ID is already registered
    pub fn register<M: KeelModule + 'static>(&mut self, module: M) {
        let id = module.id();
        if self.modules.iter().any(|m| m.id() == id) {
            panic!("Module with id '{}' is already registered", id);
        }
        self.modules.push(Box::new(module));
    }

    pub fn get(&self, id: &str) -> Option<&dyn KeelModule> {
        self.modules
            .iter()
            .find(|m| m.id() == id)
            .map(|m| m.as_ref())
    }

    pub fn modules(&self) -> &[Box<dyn KeelModule>] {
        &self.modules
    }

    /// Registers all modules into a Lua context, stopping at the first error
    pub fn register_all(&self, lua: &Lua) -> LuaResult<()> {
        for module in &self.modules {
            module.register(lua)?;
        }
        Ok(())
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
