//! Usage thresholds derived from the configured allow duration.
//!
//! All three thresholds follow a single user-facing knob: the allow
//! duration. Disable fires after the full duration, the reminder at three
//! quarters of it, and an application only counts as recently used while
//! it is younger than both the allow duration and a fixed two day ceiling.

use chrono::Duration;
use std::sync::{PoisonError, RwLock};

/// Floor applied to every derived threshold.
const MIN_THRESHOLD_MS: i64 = 60 * 1000;

/// Ceiling for the "recently used" threshold.
const RECENT_CEILING_MS: i64 = 2 * 24 * 60 * 60 * 1000;

const DEFAULT_WARNING_MS: i64 = 3 * 24 * 60 * 60 * 1000;
const DEFAULT_DISABLE_MS: i64 = 4 * 24 * 60 * 60 * 1000;

/// Smallest duration any threshold (and the block threshold) may take.
pub fn min_threshold() -> Duration {
    Duration::milliseconds(MIN_THRESHOLD_MS)
}

/// The threshold triple used by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Last use younger than this counts as RECENT.
    pub recent: Duration,
    /// A reminder fires once this much time has passed since last use.
    pub warning: Duration,
    /// A disable recommendation fires once this much time has passed.
    pub disable: Duration,
}

impl Thresholds {
    /// Derive the triple from an allow duration, clamping to one minute.
    pub fn from_allow_duration(allow_duration: Duration) -> Self {
        let sanitized = allow_duration.num_milliseconds().max(MIN_THRESHOLD_MS);
        Self {
            recent: Duration::milliseconds(sanitized.min(RECENT_CEILING_MS)),
            warning: Duration::milliseconds((sanitized * 3 / 4).max(MIN_THRESHOLD_MS)),
            disable: Duration::milliseconds(sanitized),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            recent: Duration::milliseconds(RECENT_CEILING_MS),
            warning: Duration::milliseconds(DEFAULT_WARNING_MS),
            disable: Duration::milliseconds(DEFAULT_DISABLE_MS),
        }
    }
}

/// Thread-safe holder of the thresholds currently in effect.
///
/// Readers always observe a complete triple: the update replaces all three
/// values inside one critical section.
#[derive(Debug, Default)]
pub struct UsagePolicy {
    thresholds: RwLock<Thresholds>,
}

impl UsagePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a policy already aligned with `allow_duration`.
    pub fn with_allow_duration(allow_duration: Duration) -> Self {
        Self {
            thresholds: RwLock::new(Thresholds::from_allow_duration(allow_duration)),
        }
    }

    /// Snapshot of the current thresholds.
    pub fn thresholds(&self) -> Thresholds {
        *self
            .thresholds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Align thresholds with a new allow duration.
    ///
    /// Returns `true` when any of the three values changed, so callers can
    /// skip an expensive re-evaluation when nothing moved.
    pub fn update_thresholds(&self, allow_duration: Duration) -> bool {
        let derived = Thresholds::from_allow_duration(allow_duration);
        let mut guard = self
            .thresholds
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *guard == derived {
            return false;
        }
        *guard = derived;
        true
    }

    /// Whether a package is excluded from all automation.
    ///
    /// Nothing is skipped yet; this is the hook for trusted applications.
    pub fn should_skip(&self, _package_id: &str) -> bool {
        false
    }
}
