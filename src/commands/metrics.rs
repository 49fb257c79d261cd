//! Traffic metrics toggle.

use anyhow::Result;
use std::path::Path;

use crate::cli::Toggle;
use crate::control::Method;

pub async fn run(state: Toggle, config_path: &Path) -> Result<()> {
    let report = super::request(config_path, Method::SetMetrics { enabled: state.is_on() }).await?;
    println!(
        "[OK] Traffic metrics {}",
        if report.metrics_enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
