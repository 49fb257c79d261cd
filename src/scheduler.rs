//! Time source and the single deadline timer.
//!
//! The engine keeps exactly one outstanding timer, armed to the earliest
//! of the pending automatic re-block and the cooldown expiries. Any change
//! to either recomputes the target; with nothing pending the timer never
//! fires.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, PoisonError};

use crate::resolver::CooldownTable;

/// Longest single sleep. Wall-clock jumps (suspend, NTP) are caught up
/// after at most this long because the target is recomputed on wakeup.
const MAX_SLEEP_SECS: i64 = 60;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Earliest deadline among the pending re-block and the cooldowns.
pub fn next_wakeup(reblock: Option<DateTime<Utc>>, cooldowns: &CooldownTable) -> Option<DateTime<Utc>> {
    match (reblock, cooldowns.next_expiry()) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// How long to sleep before re-checking `deadline`.
///
/// `None` when nothing is pending.
pub fn sleep_for(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<std::time::Duration> {
    let deadline = deadline?;
    let remaining = (deadline - now).clamp(Duration::zero(), Duration::seconds(MAX_SLEEP_SECS));
    Some(remaining.to_std().unwrap_or(std::time::Duration::ZERO))
}

/// Sleep until `deadline` may have passed. Pends forever when `None`.
pub async fn wait_for(deadline: Option<DateTime<Utc>>, clock: &dyn Clock) {
    match sleep_for(deadline, clock.now()) {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}
