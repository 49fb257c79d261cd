//! Init command: write the commented default configuration.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::info;

use crate::config::Config;

pub async fn run(force: bool, config_path: &Path) -> Result<()> {
    if config_path.exists() && !force {
        println!("Config already exists: {}", config_path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    write_default_config(config_path)?;
    println!("[OK] Default config written to {}", config_path.display());
    println!("     Edit it, then start the daemon with 'appfence run'.");
    Ok(())
}

/// Write the template to `path` with mode 0600 (it may hold a webhook token).
pub(crate) fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create config directory {:?}", parent))?;
    }
    fs::write(path, Config::generate_default_yaml())
        .with_context(|| format!("Failed to write config file {:?}", path))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .context("Failed to set config file permissions")?;
    info!("Wrote default config to {:?}", path);
    Ok(())
}
