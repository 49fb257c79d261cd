//! Allow duration command implementation.

use anyhow::Result;
use std::path::Path;

use crate::control::Method;
use crate::validation::parse_interval;

pub async fn run(value: &str, config_path: &Path) -> Result<()> {
    // fail fast on the client side, the daemon validates again
    parse_interval(value)?;

    let report = super::request(
        config_path,
        Method::SetAllowDuration {
            duration: value.to_string(),
        },
    )
    .await?;

    println!("[OK] Allow duration set to {}", report.allow_duration);
    Ok(())
}
