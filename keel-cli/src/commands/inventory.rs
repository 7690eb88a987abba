//! Inventory command handler
//!
//! Prints every node with its groups, selected roles and merged variables,
//! so precedence problems can be spotted without running anything.

use anyhow::{Context, Result};
use colored::*;
use keel_core::PipelineError;
use keel_runner::{Definitions, ResolvedInventory, resolve};

use crate::config::DefinitionArgs;

pub async fn handle_inventory(defs: DefinitionArgs, node: Option<String>, json: bool) -> Result<i32> {
    let config = defs.pipeline_config();

    let resolved = match load(&config) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            return Ok(e.exit_code());
        }
    };

    let nodes: Vec<_> = resolved
        .nodes
        .iter()
        .filter(|n| node.as_deref().is_none_or(|name| n.node.name == name))
        .collect();

    if let Some(name) = &node {
        if nodes.is_empty() {
            anyhow::bail!("node '{}' is not in the inventory", name);
        }
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&nodes).context("Failed to serialize inventory")?
        );
        return Ok(0);
    }

    println!("{}", format!("{} node(s):", nodes.len()).bold());
    println!();
    for resolved in nodes {
        let node = &resolved.node;
        println!("  {} {}", "▸".cyan(), node.name.bold());
        println!(
            "    Container: {} ({})",
            node.connection.container,
            node.connection.runtime.to_string().dimmed()
        );
        if !node.groups.is_empty() {
            println!("    Groups:    {}", node.groups.join(", ").dimmed());
        }
        if resolved.roles.is_empty() {
            println!("    Roles:     {}", "none".dimmed());
        } else {
            println!("    Roles:     {}", resolved.roles.join(", "));
        }
        for (key, value) in &resolved.vars {
            println!("      {} = {}", key.cyan(), value);
        }
        println!();
    }

    Ok(0)
}

fn load(config: &keel_runner::PipelineConfig) -> Result<ResolvedInventory, PipelineError> {
    let defs = Definitions::load(config)?;
    resolve(&defs.inventory, &defs.site, &config.extra_vars)
}
