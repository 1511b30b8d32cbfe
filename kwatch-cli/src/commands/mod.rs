pub mod config;
pub mod replay;

use std::path::Path;

use anyhow::{Context, Result};

use kwatch_core::EngineConfig;

/// Explicit `--config` path, else `$KWATCH_CONFIG`, else `~/.kwatch.yaml`.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => kwatch_core::config::load_at(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => kwatch_core::config::load().context("failed to load config"),
    }
}
