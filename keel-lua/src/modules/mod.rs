//! Lua modules for definition scripts
//!
//! - `keel`: constructors for inventory and site tables
//! - `log`: diagnostics while a definition is evaluated
//! - `params`: extra variables given on the command line

pub mod dsl;
pub mod log;
pub mod params;

pub use dsl::DslModule;
pub use log::{LogModule, LogSink, TracingLogSink};
pub use params::{ParamsModule, StaticVars, VarProvider};
