//! Centralized validation functions for AppFence.
//!
//! This module provides unified validation for:
//! - Duration strings (`"4d"`, `"90m"`) used for the allow duration and
//!   the evaluation interval
//! - Package identifiers accepted from the CLI and the control socket

use anyhow::{bail, Result};
use chrono::Duration;

/// Maximum accepted length of a package identifier.
const MAX_PACKAGE_ID_LEN: usize = 255;

/// Longest interval accepted anywhere (one year).
pub const MAX_INTERVAL_DAYS: i64 = 365;

/// Upper bound for the allow duration and the evaluation interval.
pub fn max_interval() -> Duration {
    Duration::days(MAX_INTERVAL_DAYS)
}

/// Interval validation (e.g., "4d", "30m", "90s").
///
/// Returns `true` if the interval is syntactically valid. Zero is
/// syntactically valid here; [`parse_interval`] rejects it.
///
/// # Examples
/// ```
/// use appfence::validation::is_valid_interval;
/// assert!(is_valid_interval("4d"));
/// assert!(is_valid_interval("30m"));
/// assert!(!is_valid_interval("4x"));
/// assert!(!is_valid_interval(""));
/// ```
pub fn is_valid_interval(interval: &str) -> bool {
    // Reject non-ASCII to prevent Unicode edge cases with byte slicing
    if !interval.is_ascii() || interval.len() < 2 {
        return false;
    }

    let (num_part, suffix) = interval.split_at(interval.len() - 1);
    matches!(suffix, "s" | "m" | "h" | "d") && num_part.parse::<u32>().is_ok()
}

/// Parse an interval string into a strictly positive duration.
///
/// # Errors
/// Returns an error for malformed input, a zero-length interval, or an
/// interval longer than [`MAX_INTERVAL_DAYS`].
///
/// # Examples
/// ```
/// use appfence::validation::parse_interval;
/// assert_eq!(parse_interval("4d").unwrap(), chrono::Duration::days(4));
/// assert!(parse_interval("0m").is_err());
/// assert!(parse_interval("100000000d").is_err());
/// ```
pub fn parse_interval(interval: &str) -> Result<Duration> {
    if !is_valid_interval(interval) {
        bail!(
            "Invalid interval '{}'. Use format like '4d', '12h', '30m', '90s'",
            interval
        );
    }

    let (num_part, suffix) = interval.split_at(interval.len() - 1);
    let value = i64::from(num_part.parse::<u32>()?);
    if value == 0 {
        bail!("Invalid interval '{}'. Duration must be positive", interval);
    }

    let duration = match suffix {
        "s" => Duration::seconds(value),
        "m" => Duration::minutes(value),
        "h" => Duration::hours(value),
        _ => Duration::days(value),
    };
    if duration > max_interval() {
        bail!(
            "Invalid interval '{}'. Duration must not exceed {}d",
            interval,
            MAX_INTERVAL_DAYS
        );
    }
    Ok(duration)
}

/// Render a duration in the most compact interval form that round-trips
/// through [`parse_interval`].
pub fn format_interval(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs > 0 && secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs > 0 && secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Validate a package identifier (e.g. `org.example.mail`).
///
/// # Examples
/// ```
/// use appfence::validation::validate_package_id;
/// assert!(validate_package_id("org.example.mail").is_ok());
/// assert!(validate_package_id("bad id").is_err());
/// ```
pub fn validate_package_id(package_id: &str) -> Result<()> {
    if package_id.is_empty() {
        bail!("Package id cannot be empty");
    }
    if package_id.len() > MAX_PACKAGE_ID_LEN {
        bail!(
            "Package id is too long ({} > {} characters)",
            package_id.len(),
            MAX_PACKAGE_ID_LEN
        );
    }
    if !package_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
    {
        bail!(
            "Invalid package id '{}'. Only ASCII letters, digits, '.', '_' and '-' are allowed",
            package_id
        );
    }
    Ok(())
}
