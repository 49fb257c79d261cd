//! Disable command implementation.

use anyhow::Result;
use std::path::Path;

use crate::control::Method;

/// Run the disable command
pub async fn run(config_path: &Path) -> Result<()> {
    super::request(config_path, Method::Disable).await?;

    println!("[OK] AppFence disabled");
    println!("     Rules removed. Run 'appfence enable' to re-enable.");
    Ok(())
}
