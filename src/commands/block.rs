//! Block-now command implementation.

use anyhow::Result;
use std::path::Path;

use crate::control::Method;

pub async fn run(config_path: &Path) -> Result<()> {
    let report = super::request(config_path, Method::BlockNow).await?;

    println!("[OK] {}", super::phase_line(&report));
    for package in &report.firewall.blocked_packages {
        println!("     - {}", package);
    }
    Ok(())
}
