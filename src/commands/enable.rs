//! Enable command implementation.

use anyhow::Result;
use std::path::Path;

use crate::control::Method;

/// Run the enable command
pub async fn run(config_path: &Path) -> Result<()> {
    let report = super::request(config_path, Method::Enable).await?;

    println!("[OK] AppFence enabled");
    println!("     {}", super::phase_line(&report));
    println!("     {} apps restricted", report.firewall.blocked_packages.len());
    Ok(())
}
