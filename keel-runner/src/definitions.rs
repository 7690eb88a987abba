//! Definition loading
//!
//! Reads the site and inventory files, evaluates them through `keel-lua`
//! and collects the template sources they reference. Everything after this
//! point works on memory only, so the quality gate never touches disk.

use anyhow::Context;
use keel_core::PipelineError;
use keel_core::domain::inventory::Inventory;
use keel_core::domain::role::{ResourceSpec, Site};
use keel_lua::{StaticVars, parse_inventory, parse_site};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::config::PipelineConfig;

/// Directory below the site directory holding template sources
pub const TEMPLATES_DIR: &str = "templates";

/// Parsed definitions of one run
#[derive(Debug, Clone)]
pub struct Definitions {
    pub site: Site,
    pub inventory: Inventory,

    /// Directory the site file lives in
    pub site_dir: PathBuf,

    /// Template sources by their `src` name; missing files are absent
    templates: BTreeMap<String, String>,
}

impl Definitions {
    pub fn new(site: Site, inventory: Inventory) -> Self {
        Self {
            site,
            inventory,
            site_dir: PathBuf::from("."),
            templates: BTreeMap::new(),
        }
    }

    /// Registers a template source
    pub fn with_template(mut self, src: impl Into<String>, content: impl Into<String>) -> Self {
        self.templates.insert(src.into(), content.into());
        self
    }

    /// Loads and parses both definition files
    ///
    /// Any failure is a `ConfigError`: nothing can be linted before the
    /// definitions evaluate.
    pub fn load(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Self::load_files(config).map_err(|e| PipelineError::config(format!("{:#}", e)))
    }

    fn load_files(config: &PipelineConfig) -> anyhow::Result<Self> {
        let params = StaticVars::new(config.extra_vars.clone());

        let inventory_source = std::fs::read_to_string(&config.inventory_path).with_context(|| {
            format!("Failed to read inventory {}", config.inventory_path.display())
        })?;
        let inventory = parse_inventory(
            &inventory_source,
            &chunk_name(&config.inventory_path),
            params.clone(),
        )?;

        let site_source = std::fs::read_to_string(&config.site_path)
            .with_context(|| format!("Failed to read site {}", config.site_path.display()))?;
        let site = parse_site(&site_source, &chunk_name(&config.site_path), params)?;

        let site_dir = config.site_dir();
        let templates = read_templates(&site, &site_dir.join(TEMPLATES_DIR))?;

        debug!(
            "Loaded site '{}' ({} roles, {} plays) and {} node(s)",
            site.name,
            site.roles.len(),
            site.plays.len(),
            inventory.nodes.len()
        );

        Ok(Self {
            site,
            inventory,
            site_dir,
            templates,
        })
    }

    /// Template source by `src` name
    pub fn template(&self, src: &str) -> Option<&str> {
        self.templates.get(src).map(String::as_str)
    }
}

fn chunk_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// True if `src` stays inside the templates directory
pub fn is_safe_template_path(src: &str) -> bool {
    let path = Path::new(src);
    !src.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn read_templates(site: &Site, dir: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let mut templates = BTreeMap::new();

    let sources = site
        .roles
        .iter()
        .flat_map(|r| r.tasks.iter())
        .filter_map(|t| match &t.resource {
            ResourceSpec::Template { src, .. } => Some(src),
            _ => None,
        });

    for src in sources {
        if templates.contains_key(src) || !is_safe_template_path(src) {
            continue;
        }
        let path = dir.join(src);
        if !path.is_file() {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read template {}", path.display()))?;
        templates.insert(src.clone(), content);
    }

    Ok(templates)
}
