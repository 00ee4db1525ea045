//! Command implementations for the cortex CLI.
//!
//! Each submodule implements the logic for a command group.

pub mod fact;
pub mod maintain;
pub mod observe;
pub mod sandbox;
pub mod skill;

use anyhow::{Context, Result};
use colored::Colorize;
use cortex_core::{Brain, CortexConfig};
use std::path::Path;
use tracing::debug;

/// Resolve configuration: explicit file, else ~/.cortex/config.toml if it
/// exists, else defaults. `--db` wins over the file.
pub fn load_config(path: Option<&Path>, db: Option<&Path>) -> Result<CortexConfig> {
    let mut config = match path {
        Some(path) => CortexConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CortexConfig::load_or_default(&CortexConfig::config_path())
            .context("Failed to load default config")?,
    };
    if let Some(db) = db {
        config = config.with_database(db);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub fn open_brain(config: CortexConfig) -> Result<Brain> {
    let path = config.database_path.clone();
    debug!(path = %path.display(), "opening memory store");
    Brain::open(config).with_context(|| format!("Failed to open memory store at {}", path.display()))
}

/// Confidence rendered with a color for its band.
pub fn confidence_display(confidence: f64) -> String {
    let text = format!("{:.2}", confidence);
    if confidence >= 0.7 {
        text.green().to_string()
    } else if confidence >= 0.5 {
        text.yellow().to_string()
    } else {
        text.red().to_string()
    }
}
