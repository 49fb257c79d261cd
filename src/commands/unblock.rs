//! Manual unblock command implementation.

use anyhow::Result;
use std::path::Path;

use crate::control::Method;
use crate::utils::format_timestamp;
use crate::validation::validate_package_id;

pub async fn run(package: &str, config_path: &Path) -> Result<()> {
    validate_package_id(package)?;

    let report = super::request(
        config_path,
        Method::Unblock {
            package_id: package.to_string(),
        },
    )
    .await?;

    match report.cooldowns.iter().find(|c| c.package_id == package) {
        Some(cooldown) => println!(
            "[OK] {} unblocked until {}",
            package,
            format_timestamp(cooldown.until)
        ),
        None => println!("[OK] {} unblocked", package),
    }
    Ok(())
}
