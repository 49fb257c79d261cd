//! Block-list resolution.
//!
//! Turns the current classification, the manual-override flag, the
//! per-package cooldown table and the allowlist into the set of package
//! ids that should be blocked.
//!
//! Candidates are RARE packages last used at or before `now - threshold`
//! (or never used) plus every DISABLED package. In automatic mode the
//! result is exactly the candidate set. In manual mode the currently
//! applied set is sticky: nothing leaves it unless the user unblocks it,
//! and a candidate only joins once its cooldown has expired. The agent's
//! own id and allowlisted ids are always stripped.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::store::{TrackedApplication, UsageStatus};
use crate::utils::{saturating_add, saturating_sub};

/// Ordered set of package ids applied to the enforcement surface.
pub type BlockSet = BTreeSet<String>;

/// The parts of the classification the resolver needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationSnapshot {
    /// RARE packages with their last use time.
    pub rare: Vec<(String, Option<DateTime<Utc>>)>,
    /// DISABLED packages.
    pub disabled: Vec<String>,
}

impl ClassificationSnapshot {
    pub fn from_apps(apps: &[TrackedApplication]) -> Self {
        let mut snapshot = Self::default();
        for app in apps {
            match app.status {
                UsageStatus::Rare => snapshot.rare.push((app.package_id.clone(), app.last_used_at)),
                UsageStatus::Disabled => snapshot.disabled.push(app.package_id.clone()),
                UsageStatus::Recent => {}
            }
        }
        snapshot
    }

    pub fn is_disabled(&self, package_id: &str) -> bool {
        self.disabled.iter().any(|p| p == package_id)
    }
}

/// Temporary per-package exemptions created by manual unblocks.
///
/// In-memory only: a restart forgets every cooldown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CooldownTable {
    entries: HashMap<String, DateTime<Utc>>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the exemption deadline of a package.
    pub fn insert(&mut self, package_id: impl Into<String>, until: DateTime<Utc>) {
        self.entries.insert(package_id.into(), until);
    }

    pub fn remove(&mut self, package_id: &str) -> bool {
        self.entries.remove(package_id).is_some()
    }

    pub fn get(&self, package_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(package_id).copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose deadline is at or before `now`.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, until| *until > now);
        before - self.entries.len()
    }

    /// Earliest pending deadline.
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.entries.values().min().copied()
    }

    /// Entries ordered by deadline.
    pub fn entries(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    fn is_active(&self, package_id: &str, now: DateTime<Utc>) -> bool {
        self.entries.get(package_id).is_some_and(|until| *until > now)
    }
}

/// Inputs of one resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub snapshot: &'a ClassificationSnapshot,
    pub manual_override: bool,
    /// Set currently applied to the enforcement surface.
    pub applied: &'a BlockSet,
    pub now: DateTime<Utc>,
    pub block_threshold: Duration,
    pub allowlist: &'a BTreeSet<String>,
    pub self_id: &'a str,
}

/// Compute the desired block set.
///
/// The only mutations are the expiry sweep and, in manual mode, dropping
/// cooldowns of DISABLED candidates. Both are idempotent, so resolving
/// twice with unchanged inputs yields the same set.
pub fn resolve(request: &ResolveRequest<'_>, cooldowns: &mut CooldownTable) -> BlockSet {
    let cutoff = saturating_sub(request.now, request.block_threshold);

    let rare = request
        .snapshot
        .rare
        .iter()
        .filter(|(_, last_used)| last_used.map_or(true, |t| t <= cutoff))
        .map(|(id, _)| id.as_str());
    let disabled = request.snapshot.disabled.iter().map(String::as_str);
    let candidates: BTreeSet<&str> = rare.chain(disabled).collect();

    let expired = cooldowns.expire(request.now);
    if expired > 0 {
        debug!("Expired {} manual unblock cooldowns", expired);
    }

    let mut result: BlockSet = if request.manual_override {
        let mut manual = request.applied.clone();
        for id in &request.snapshot.disabled {
            cooldowns.remove(id);
        }
        manual.extend(
            candidates
                .iter()
                .filter(|id| !cooldowns.is_active(id, request.now))
                .map(|id| id.to_string()),
        );
        manual
    } else {
        candidates.iter().map(|id| id.to_string()).collect()
    };

    result.remove(request.self_id);
    result.retain(|id| !request.allowlist.contains(id));

    debug!(
        "Resolved block list manual={} -> {} packages",
        request.manual_override,
        result.len()
    );
    result
}

/// Deadline of a new manual unblock cooldown.
///
/// The exemption lasts until the sooner of the pending automatic
/// re-block (when still in the future) and one allow duration from now,
/// falling back to one block threshold.
pub fn cooldown_deadline(
    now: DateTime<Utc>,
    pending_reblock: Option<DateTime<Utc>>,
    allow_duration: Duration,
    block_threshold: Duration,
) -> DateTime<Utc> {
    let reblock = pending_reblock.filter(|at| *at > now);
    let allow = (allow_duration > Duration::zero()).then(|| saturating_add(now, allow_duration));
    match (reblock, allow) {
        (Some(a), Some(b)) => a.min(b),
        (Some(t), None) | (None, Some(t)) => t,
        (None, None) => saturating_add(now, block_threshold),
    }
}
