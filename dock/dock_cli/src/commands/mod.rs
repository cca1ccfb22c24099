//! Command handlers for the dock binary.

pub mod check;
pub mod serve;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dock_runtime::RuntimeConfig;

/// Load the configuration and apply command-line overrides.
///
/// Runs on a throwaway current-thread runtime: the reactor itself is sized
/// from the configuration it reads.
pub fn load_config(path: Option<&Path>, packages_root: Option<PathBuf>) -> Result<RuntimeConfig> {
    let loader = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start configuration loader")?;
    let mut config = loader.block_on(RuntimeConfig::load(path))?;

    if let Some(root) = packages_root {
        config.packages_root = root;
    }
    Ok(config)
}
