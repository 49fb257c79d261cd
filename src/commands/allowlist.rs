//! Allowlist command implementation.

use anyhow::Result;
use std::path::Path;

use crate::cli::AllowlistAction;
use crate::config::Config;
use crate::control::Method;
use crate::error::AppFenceError;
use crate::validation::validate_package_id;

/// Run the allowlist command
pub async fn run(action: AllowlistAction, config_path: &Path) -> Result<()> {
    match action {
        AllowlistAction::Add { package } => add_to_allowlist(&package, config_path).await,
        AllowlistAction::Del { package } => remove_from_allowlist(&package, config_path).await,
        AllowlistAction::List => list_allowlist(config_path).await,
    }
}

async fn add_to_allowlist(package: &str, config_path: &Path) -> Result<()> {
    validate_package_id(package)?;

    let report = super::request(
        config_path,
        Method::AllowlistAdd {
            package_id: package.to_string(),
        },
    )
    .await?;

    println!("[OK] {} will never be blocked", package);
    println!("     {} packages allowlisted", report.allowlist.len());
    Ok(())
}

async fn remove_from_allowlist(package: &str, config_path: &Path) -> Result<()> {
    let report = super::request(
        config_path,
        Method::AllowlistRemove {
            package_id: package.to_string(),
        },
    )
    .await?;

    println!("[OK] Removed {} from allowlist", package);
    println!("     {} packages allowlisted", report.allowlist.len());
    Ok(())
}

/// List the allowlist, reading the config file when the daemon is down.
async fn list_allowlist(config_path: &Path) -> Result<()> {
    let allowlist = match super::request(config_path, Method::Status).await {
        Ok(report) => report.allowlist,
        Err(e) if matches!(e.downcast_ref::<AppFenceError>(), Some(AppFenceError::DaemonNotRunning(_))) => {
            let mut packages = Config::load_or_default(config_path)?.allowlist;
            packages.sort();
            packages
        }
        Err(e) => return Err(e),
    };

    if allowlist.is_empty() {
        println!("Allowlist is empty");
        return Ok(());
    }
    println!("Allowlisted packages:");
    for package in &allowlist {
        println!("  {}", package);
    }
    println!();
    println!("Total: {} packages", allowlist.len());
    Ok(())
}
