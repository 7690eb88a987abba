//! Core domain types
//!
//! This module contains the structures shared between the definition loader
//! (keel-lua), the pipeline engine (keel-runner) and the CLI. They describe
//! what is declared (inventory, roles, plays) and what happened (findings,
//! violations, run records).

pub mod finding;
pub mod inventory;
pub mod lint;
pub mod log;
pub mod probe;
pub mod role;
pub mod run;
pub mod selector;

/// Variable mapping visible to templates
pub type Vars = std::collections::BTreeMap<String, serde_json::Value>;
