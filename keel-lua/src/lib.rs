//! Keel Lua Infrastructure
//!
//! Inventory and site files are Lua scripts that return tables. This crate
//! evaluates them in a restricted sandbox and turns the result into the
//! domain types of `keel-core`. It includes:
//! - Module trait and registry for Lua modules
//! - The definition sandbox
//! - The `keel`, `log` and `params` modules
//! - Inventory and site parsing
//! - Stub generation for editor support

pub mod module;
pub mod modules;
pub mod parser;
pub mod sandbox;

pub use module::{KeelModule, ModuleRegistry};
pub use modules::{DslModule, LogModule, LogSink, ParamsModule, StaticVars, VarProvider};
pub use parser::{parse_inventory, parse_site};
pub use sandbox::{create_sandbox, definition_registry};
