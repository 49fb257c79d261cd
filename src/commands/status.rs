//! Status command implementation.

use anyhow::Result;
use chrono::Utc;
use std::path::Path;

use crate::control::Method;
use crate::engine::{StatusReport, UsageAccess};
use crate::utils::{format_relative, truncate};

/// Column width of package ids in the rare-app table.
const PACKAGE_WIDTH: usize = 40;

/// Run the status command
pub async fn run(json: bool, config_path: &Path) -> Result<()> {
    let report = super::request(config_path, Method::Status).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    print_report(&report);
    Ok(())
}

fn print_report(report: &StatusReport) {
    let now = Utc::now();
    println!();
    println!("{}", super::phase_line(report));
    println!("Backend: {}", report.backend);
    println!(
        "Mode: {}",
        if report.manual_mode { "manual unblock" } else { "automatic" }
    );
    println!("Allow duration: {}", report.allow_duration);
    println!(
        "Traffic metrics: {}",
        if report.metrics_enabled { "enabled" } else { "disabled" }
    );
    if report.usage_access == UsageAccess::Ungranted {
        println!("Usage access: NOT GRANTED (evaluation suspended)");
    }
    println!();

    println!(
        "Apps: {} recent, {} rare, {} disabled",
        report.apps.recent, report.apps.rare, report.apps.disabled
    );
    println!("Restricted: {}", report.firewall.blocked_packages.len());
    match report.last_evaluation {
        Some(at) => println!("Last evaluation: {}", format_relative(at, now)),
        None => println!("Last evaluation: never"),
    }
    if let Some(at) = report.next_wakeup {
        println!("Next deadline: {}", format_relative(at, now));
    }

    if !report.rare_apps.is_empty() {
        println!();
        println!("Rarely used:");
        for app in &report.rare_apps {
            let last_used = app
                .last_used_at
                .map(|t| format_relative(t, now))
                .unwrap_or_else(|| "never".to_string());
            let marker = if report.firewall.blocked_packages.contains(&app.package_id) {
                "blocked"
            } else {
                "open"
            };
            println!(
                "  {:<width$} {:>12}  {}",
                truncate(&app.package_id, PACKAGE_WIDTH),
                last_used,
                marker,
                width = PACKAGE_WIDTH
            );
        }
    }

    if !report.cooldowns.is_empty() {
        println!();
        println!("Unblocked manually:");
        for cooldown in &report.cooldowns {
            println!("  {} until {}", cooldown.package_id, format_relative(cooldown.until, now));
        }
    }

    if !report.allowlist.is_empty() {
        println!();
        println!("Allowlisted: {}", report.allowlist.join(", "));
    }
    println!();
}
