//! Init command handler
//!
//! Scaffolds a lab: an inventory with a two-node tier and an edge node, a
//! site that serves a greeting page, and the Lua language server files
//! (.luarc.json plus stubs generated from the real modules).

use anyhow::{Context, Result};
use colored::*;
use keel_lua::{KeelModule, StaticVars, definition_registry};
use std::fs;
use std::path::Path;

const STUBS_DIR: &str = ".keel/stubs";

const INVENTORY_LUA: &str = r#"-- Nodes are containers that must already be running
return {
    runtime = "docker",

    -- Visible to every node; groups and nodes override
    vars = { http_port = 80 },

    groups = {
        keel.group("tier", { greeting = params.get("greeting", "hello") }),
        keel.group("edge"),
    },

    nodes = {
        keel.node("web1", "tier", { container = "keel-web1" }),
        keel.node("web2", "tier", { container = "keel-web2" }),
        keel.node("lb", "edge", { container = "keel-lb" }),
    },
}
"#;

const SITE_LUA: &str = r#"return keel.define {
    name = "lab",
    description = "Greeting page behind an edge proxy",

    roles = {
        {
            name = "nginx",
            tasks = {
                keel.task("install nginx", keel.package("nginx")),
                keel.task(
                    "render index",
                    keel.template("index.html.tmpl", "/var/www/html/index.html", "0644"),
                    { notify = "restart nginx" }
                ),
                keel.task("nginx running", keel.service("nginx", { state = "started" })),
            },
            handlers = {
                keel.handler("restart nginx", keel.restart("nginx")),
            },
        },
    },

    plays = {
        { name = "web tier", hosts = "tier", roles = { "nginx" } },
    },

    -- Checked after convergence; add more with --probe
    verify = {},
}
"#;

const INDEX_TEMPLATE: &str = "<h1>{{ greeting }}</h1>\n";

const LUARC_JSON: &str = r#"{
  "$schema": "https://raw.githubusercontent.com/sumneko/vscode-lua/master/setting/schema.json",
  "runtime": {
    "version": "Lua 5.4"
  },
  "diagnostics": {
    "globals": ["keel", "log", "params"]
  },
  "workspace": {
    "library": [".keel/stubs"],
    "checkThirdParty": false
  },
  "completion": {
    "callSnippet": "Both"
  }
}
"#;

/// Handle `keel init`
pub async fn handle_init(dir: &Path, lua_only: bool, force: bool) -> Result<i32> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    if !lua_only {
        write_file(&dir.join("inventory.lua"), INVENTORY_LUA, force)?;
        write_file(&dir.join("site.lua"), SITE_LUA, force)?;
        let templates = dir.join("templates");
        fs::create_dir_all(&templates)
            .with_context(|| format!("Failed to create {}", templates.display()))?;
        write_file(&templates.join("index.html.tmpl"), INDEX_TEMPLATE, force)?;
    }

    write_file(&dir.join(".luarc.json"), LUARC_JSON, force)?;
    generate_stub_files(dir)?;

    println!("{}", "✓ Lab initialized!".green().bold());
    println!();
    println!("{}", "Next steps:".bold());
    println!("  1. Start the containers named in inventory.lua");
    println!("  2. Run {} to lint the definitions", "keel check".cyan());
    println!(
        "  3. Run {} to deploy",
        "keel run --probe http://localhost:8080/".cyan()
    );

    Ok(0)
}

/// Writes a file, refusing to overwrite unless forced
fn write_file(path: &Path, content: &str, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("  {} {} (exists)", "Skipped".yellow(), path.display());
        return Ok(());
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("  {} {}", "Created".green(), path.display());
    Ok(())
}

/// Generate stub files for the definition modules
///
/// Uses the registry definitions are evaluated with, so the stubs always
/// match the real modules.
fn generate_stub_files(dir: &Path) -> Result<()> {
    let stubs_dir = dir.join(STUBS_DIR);
    fs::create_dir_all(&stubs_dir)
        .with_context(|| format!("Failed to create stubs directory at {:?}", stubs_dir))?;

    let registry = definition_registry("init", StaticVars::default());
    for module in registry.modules() {
        let stub_path = stubs_dir.join(format!("{}.lua", module.id()));
        fs::write(&stub_path, module.stubs())
            .with_context(|| format!("Failed to write stub file {:?}", stub_path))?;
        println!("  {} {}.lua", "Created".green(), module.id());
    }

    println!(
        "  {} in {}",
        "Stubs ready".green(),
        stubs_dir.display().to_string().cyan()
    );
    Ok(())
}
