//! Common utility functions used across modules.
//!
//! This module provides shared formatting helpers:
//! - [`format_duration`] - Format a duration compactly (2d 4h, 15m, 30s)
//! - [`format_relative`] - Describe a timestamp relative to now (in 3h, 2d ago)
//! - [`format_timestamp`] - Render a UTC timestamp in local time
//! - [`truncate`] - Truncate strings with ellipsis
//! - [`saturating_add`] / [`saturating_sub`] - Timestamp arithmetic that clamps
//!   at the representable range instead of panicking

use chrono::{DateTime, Duration, Local, Utc};

/// Format a duration using its two most significant units.
///
/// # Examples
/// ```
/// use appfence::utils::format_duration;
/// use chrono::Duration;
/// assert_eq!(format_duration(Duration::hours(52)), "2d 4h");
/// assert_eq!(format_duration(Duration::minutes(15)), "15m");
/// assert_eq!(format_duration(Duration::seconds(30)), "30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    } else if hours > 0 {
        if minutes > 0 {
            format!("{}h {}m", hours, minutes)
        } else {
            format!("{}h", hours)
        }
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", seconds)
    }
}

/// Describe `target` relative to `now`.
///
/// # Examples
/// ```
/// use appfence::utils::format_relative;
/// use chrono::{Duration, Utc};
/// let now = Utc::now();
/// assert_eq!(format_relative(now + Duration::hours(3), now), "in 3h");
/// assert_eq!(format_relative(now - Duration::days(2), now), "2d ago");
/// ```
pub fn format_relative(target: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = target.signed_duration_since(now);
    if delta.num_seconds().abs() < 60 {
        "just now".to_string()
    } else if delta > Duration::zero() {
        format!("in {}", format_duration(delta))
    } else {
        format!("{} ago", format_duration(-delta))
    }
}

/// Render a UTC timestamp in the local time zone.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    let local: DateTime<Local> = dt.into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `t + delta`, clamped to the range `DateTime<Utc>` can represent.
///
/// # Examples
/// ```
/// use appfence::utils::saturating_add;
/// use chrono::{DateTime, Duration, Utc};
/// let now = Utc::now();
/// assert_eq!(saturating_add(now, Duration::hours(1)), now + Duration::hours(1));
/// assert_eq!(saturating_add(DateTime::<Utc>::MAX_UTC, Duration::days(1)), DateTime::<Utc>::MAX_UTC);
/// ```
pub fn saturating_add(t: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    t.checked_add_signed(delta).unwrap_or(if delta < Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// `t - delta`, clamped to the range `DateTime<Utc>` can represent.
pub fn saturating_sub(t: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    t.checked_sub_signed(delta).unwrap_or(if delta < Duration::zero() {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

/// Truncate a string to a maximum length, adding "..." if truncated.
///
/// # Examples
/// ```
/// use appfence::utils::truncate;
/// assert_eq!(truncate("short", 10), "short");
/// assert_eq!(truncate("this is long", 10), "this is...");
/// ```
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
