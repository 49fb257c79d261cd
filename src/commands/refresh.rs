//! Refresh command implementation.

use anyhow::Result;
use std::path::Path;

use crate::control::Method;

/// Ask the daemon for an immediate evaluation pass.
pub async fn run(config_path: &Path) -> Result<()> {
    let report = super::request(config_path, Method::Refresh).await?;

    println!(
        "[OK] Usage re-evaluated: {} recent, {} rare, {} disabled",
        report.apps.recent, report.apps.rare, report.apps.disabled
    );
    Ok(())
}
