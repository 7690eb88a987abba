//! Commands module
//!
//! Defines all CLI commands and their handlers. Every handler returns the
//! process exit status.

mod init;
mod inventory;
mod run;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

use crate::config::{DefinitionArgs, GateArgs, RunArgs};

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the gated pipeline: lint, scan, converge, verify
    Run {
        #[command(flatten)]
        definitions: DefinitionArgs,

        #[command(flatten)]
        gate: GateArgs,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Syntax check: load, resolve and lint without touching any node
    Check {
        #[command(flatten)]
        definitions: DefinitionArgs,

        #[command(flatten)]
        gate: GateArgs,
    },
    /// Show resolved nodes with their roles and merged variables
    Inventory {
        #[command(flatten)]
        definitions: DefinitionArgs,

        /// Only show this node
        #[arg(long)]
        node: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Scaffold a lab with definitions, a template and Lua editor support
    Init {
        /// Output directory
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Generate only .luarc.json and stubs
        #[arg(long)]
        lua_only: bool,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            definitions,
            gate,
            run,
        } => run::handle_run(definitions, gate, run).await,
        Commands::Check { definitions, gate } => run::handle_check(definitions, gate).await,
        Commands::Inventory {
            definitions,
            node,
            json,
        } => inventory::handle_inventory(definitions, node, json).await,
        Commands::Init {
            dir,
            lua_only,
            force,
        } => init::handle_init(&dir, lua_only, force).await,
    }
}
