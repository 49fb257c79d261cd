//! Allow-window command implementation.

use anyhow::Result;
use std::path::Path;

use crate::control::Method;

/// Open an allow window of one allow duration.
pub async fn run(config_path: &Path) -> Result<()> {
    let report = super::request(config_path, Method::Allow).await?;

    println!("[OK] Allowing traffic for {}", report.allow_duration);
    println!("     {}", super::phase_line(&report));
    Ok(())
}
