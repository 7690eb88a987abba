//! Keel Core
//!
//! Core types for the Keel configuration-deployment driver.
//!
//! This crate contains:
//! - Domain types: inventory, roles, findings, pipeline runs
//! - Error taxonomy shared by the gates and the driver

pub mod domain;
pub mod error;

pub use error::{ErrorKind, PipelineError, ResourceApplyError};
