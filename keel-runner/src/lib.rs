//! Keel Runner
//!
//! The pipeline engine: loads definitions, resolves the inventory, and
//! drives a run through the quality gate, the policy gate, convergence and
//! verification.
//!
//! The library never reads the environment or initializes logging; the CLI
//! builds a [`PipelineConfig`] and installs the tracing subscriber.

pub mod config;
pub mod connection;
pub mod context;
pub mod convergence;
pub mod definitions;
pub mod driver;
pub mod host;
pub mod inventory;
pub mod lint;
pub mod plan;
pub mod policy;
pub mod probe;
pub mod report;
pub mod resource;
pub mod template;

#[cfg(test)]
mod testing;

pub use config::{PipelineConfig, StageTimeouts};
pub use connection::{ContainerConnector, check_runtime_available};
pub use definitions::Definitions;
pub use driver::PipelineDriver;
pub use inventory::{ResolvedInventory, ResolvedNode, resolve};
pub use lint::QualityGate;
pub use report::{JsonFileReporter, LogReporter, Reporter};
