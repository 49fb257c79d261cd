//! Usage classification: RECENT / RARE / DISABLED tiers and notifications.
//!
//! [`UsageClassifier::evaluate`] is pure: it turns the installed app list,
//! observed foreground times and the previously stored rows into the next
//! set of rows plus the reminder and recommendation lists. Persisting the
//! rows and delivering notifications is left to the caller.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::policy::UsagePolicy;
use crate::sources::{last_foreground_times, usage_lookback, InstalledApp, PackageCatalog, UsageHistory};
use crate::store::{TrackedApplication, UsageStatus};
use crate::utils::saturating_add;

/// Result of one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageEvaluation {
    /// Every tracked application, to be upserted.
    pub updates: Vec<TrackedApplication>,
    /// Previously tracked package ids that are no longer installed.
    pub removals: Vec<String>,
    /// Applications that crossed the warning threshold.
    pub reminders: Vec<TrackedApplication>,
    /// Applications that crossed the disable threshold.
    pub recommendations: Vec<TrackedApplication>,
}

pub struct UsageClassifier {
    self_id: String,
}

impl UsageClassifier {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
        }
    }

    /// Gather platform data and classify.
    ///
    /// A failing usage-history query degrades to stored and install
    /// timestamps. A failing catalog aborts the pass: an empty inventory
    /// would otherwise remove every tracked row.
    pub async fn collect(
        &self,
        now: DateTime<Utc>,
        catalog: &dyn PackageCatalog,
        history: &dyn UsageHistory,
        existing: &[TrackedApplication],
        policy: &UsagePolicy,
    ) -> anyhow::Result<UsageEvaluation> {
        let installed = catalog.installed().await?;

        let observed = match history.query(now - usage_lookback(), now).await {
            Ok(events) => last_foreground_times(&events, &self.self_id),
            Err(e) => {
                warn!("Usage history query failed, using stored timestamps: {:#}", e);
                HashMap::new()
            }
        };

        Ok(self.evaluate(now, &installed, &observed, existing, policy))
    }

    /// Classify every trackable application.
    pub fn evaluate(
        &self,
        now: DateTime<Utc>,
        installed: &[InstalledApp],
        observed: &HashMap<String, DateTime<Utc>>,
        existing: &[TrackedApplication],
        policy: &UsagePolicy,
    ) -> UsageEvaluation {
        let thresholds = policy.thresholds();
        let previous: HashMap<&str, &TrackedApplication> =
            existing.iter().map(|a| (a.package_id.as_str(), a)).collect();
        let mut still_installed: HashSet<&str> = HashSet::new();
        let mut result = UsageEvaluation::default();

        for app in installed {
            let id = app.package_id.as_str();
            if app.system || id == self.self_id || policy.should_skip(id) {
                continue;
            }
            still_installed.insert(id);

            let prior = previous.get(id).copied();
            let last_used = resolve_last_used(observed.get(id).copied(), prior, app);
            let is_disabled = app.disabled;

            let notify_at = last_used.map(|t| saturating_add(t, thresholds.warning));
            let disable_at = last_used.map(|t| saturating_add(t, thresholds.disable));

            let mut scheduled_disable_at = if is_disabled { None } else { disable_at };
            let mut notified_at = if is_disabled {
                None
            } else {
                prior.and_then(|p| p.notified_at)
            };

            let status = if is_disabled {
                UsageStatus::Disabled
            } else if last_used.is_some_and(|t| now - t <= thresholds.recent) {
                UsageStatus::Recent
            } else {
                UsageStatus::Rare
            };

            let recommend = !is_disabled
                && disable_at.is_some_and(|d| now >= d && notified_at.map_or(true, |n| n < d));
            let remind = !is_disabled
                && notify_at.is_some_and(|w| now >= w && notified_at.map_or(true, |n| n < w))
                && disable_at.map_or(true, |d| now < d);

            if recommend {
                scheduled_disable_at = disable_at;
                notified_at = Some(now);
            } else if remind {
                notified_at = Some(now);
            } else if disable_at.is_none() {
                notified_at = None;
            }

            let row = TrackedApplication {
                package_id: app.package_id.clone(),
                label: app.display_label().to_string(),
                last_used_at: last_used,
                status,
                is_disabled,
                scheduled_disable_at,
                notified_at,
            };

            if recommend {
                result.recommendations.push(row.clone());
            } else if remind {
                result.reminders.push(row.clone());
            }
            result.updates.push(row);
        }

        result.removals = existing
            .iter()
            .filter(|a| !still_installed.contains(a.package_id.as_str()))
            .map(|a| a.package_id.clone())
            .collect();

        debug!(
            "Classified {} apps ({} removed, {} reminders, {} recommendations)",
            result.updates.len(),
            result.removals.len(),
            result.reminders.len(),
            result.recommendations.len()
        );
        result
    }
}

/// Latest of the observed and stored timestamps, falling back to the
/// install/update time when neither exists.
fn resolve_last_used(
    observed: Option<DateTime<Utc>>,
    prior: Option<&TrackedApplication>,
    app: &InstalledApp,
) -> Option<DateTime<Utc>> {
    let stored = prior.and_then(|p| p.last_used_at);
    match (observed, stored) {
        (Some(o), Some(s)) => Some(o.max(s)),
        (Some(t), None) | (None, Some(t)) => Some(t),
        (None, None) => app.install_fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{UsageEvent, UsageEventKind};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap()
    }

    fn installed(id: &str) -> InstalledApp {
        InstalledApp {
            package_id: id.to_string(),
            label: format!("{} label", id),
            uid: None,
            installed_at: Some(now() - Duration::days(60)),
            updated_at: None,
            disabled: false,
            system: false,
        }
    }

    fn observed(entries: &[(&str, Duration)]) -> HashMap<String, DateTime<Utc>> {
        entries
            .iter()
            .map(|(id, ago)| (id.to_string(), now() - *ago))
            .collect()
    }

    fn classify(
        apps: &[InstalledApp],
        seen: &HashMap<String, DateTime<Utc>>,
        existing: &[TrackedApplication],
    ) -> UsageEvaluation {
        UsageClassifier::new("org.appfence").evaluate(now(), apps, seen, existing, &UsagePolicy::new())
    }

    #[test]
    fn test_status_tiers() {
        let mut disabled = installed("d");
        disabled.disabled = true;
        let apps = vec![installed("recent"), installed("rare"), disabled];
        let seen = observed(&[("recent", Duration::hours(5)), ("rare", Duration::days(3)), ("d", Duration::hours(1))]);

        let eval = classify(&apps, &seen, &[]);
        let status: HashMap<_, _> = eval.updates.iter().map(|a| (a.package_id.as_str(), a.status)).collect();
        assert_eq!(status["recent"], UsageStatus::Recent);
        assert_eq!(status["rare"], UsageStatus::Rare);
        assert_eq!(status["d"], UsageStatus::Disabled);
    }

    #[test]
    fn test_huge_allow_duration_does_not_overflow() {
        let policy = UsagePolicy::with_allow_duration(Duration::days(100_000_000));
        let eval = UsageClassifier::new("org.appfence").evaluate(
            now(),
            &[installed("a"), installed("b")],
            &observed(&[("a", Duration::days(3))]),
            &[],
            &policy,
        );
        assert_eq!(eval.updates.len(), 2);
        assert!(eval.reminders.is_empty());
        assert!(eval.recommendations.is_empty());
    }

    #[test]
    fn test_recent_boundary_is_inclusive() {
        let eval = classify(&[installed("a")], &observed(&[("a", Duration::days(2))]), &[]);
        assert_eq!(eval.updates[0].status, UsageStatus::Recent);
    }

    #[test]
    fn test_disabled_rows_invariant() {
        let mut app = installed("a");
        app.disabled = true;
        let prior = TrackedApplication {
            package_id: "a".into(),
            label: "a".into(),
            last_used_at: Some(now() - Duration::days(10)),
            status: UsageStatus::Rare,
            is_disabled: false,
            scheduled_disable_at: Some(now() - Duration::days(6)),
            notified_at: Some(now() - Duration::days(6)),
        };
        let eval = classify(&[app], &HashMap::new(), &[prior]);
        let row = &eval.updates[0];
        assert!(row.is_disabled);
        assert_eq!(row.status, UsageStatus::Disabled);
        assert_eq!(row.notified_at, None);
        assert_eq!(row.scheduled_disable_at, None);
        assert!(eval.recommendations.is_empty());
        assert!(eval.reminders.is_empty());
    }

    #[test]
    fn test_last_used_prefers_latest_and_never_regresses() {
        let prior = TrackedApplication {
            package_id: "a".into(),
            label: "a".into(),
            last_used_at: Some(now() - Duration::hours(1)),
            status: UsageStatus::Recent,
            is_disabled: false,
            scheduled_disable_at: None,
            notified_at: None,
        };
        let eval = classify(&[installed("a")], &observed(&[("a", Duration::days(3))]), &[prior]);
        assert_eq!(eval.updates[0].last_used_at, Some(now() - Duration::hours(1)));
    }

    #[test]
    fn test_install_time_fallback() {
        let eval = classify(&[installed("a")], &HashMap::new(), &[]);
        assert_eq!(eval.updates[0].last_used_at, Some(now() - Duration::days(60)));
        assert_eq!(eval.updates[0].status, UsageStatus::Rare);
    }

    #[test]
    fn test_reminder_fires_once() {
        let seen = observed(&[("a", Duration::hours(80))]);
        let first = classify(&[installed("a")], &seen, &[]);
        assert_eq!(first.reminders.len(), 1);
        assert!(first.recommendations.is_empty());
        assert_eq!(first.updates[0].notified_at, Some(now()));

        let second = classify(&[installed("a")], &seen, &first.updates);
        assert!(second.reminders.is_empty());
        assert_eq!(second.updates[0].notified_at, Some(now()));
    }

    #[test]
    fn test_recommendation_takes_priority_and_fires_once() {
        let seen = observed(&[("a", Duration::days(5))]);
        let first = classify(&[installed("a")], &seen, &[]);
        assert_eq!(first.recommendations.len(), 1);
        assert!(first.reminders.is_empty());
        let row = &first.updates[0];
        assert_eq!(row.scheduled_disable_at, Some(now() - Duration::days(1)));
        assert_eq!(row.notified_at, Some(now()));

        let second = classify(&[installed("a")], &seen, &first.updates);
        assert!(second.recommendations.is_empty());
        assert!(second.reminders.is_empty());
    }

    #[test]
    fn test_reminder_after_recommendation_when_used_again() {
        let stale = classify(&[installed("a")], &observed(&[("a", Duration::days(5))]), &[]);
        // used again 80h ago relative to now: crosses warning but not disable
        let fresh = classify(&[installed("a")], &observed(&[("a", Duration::hours(80))]), &stale.updates);
        // stored last_used is older than observed, observed wins
        assert_eq!(fresh.updates[0].last_used_at, Some(now() - Duration::hours(80)));
        // notified_at (now) is after the new warning crossing, so nothing fires
        assert!(fresh.reminders.is_empty());
    }

    #[test]
    fn test_never_used_without_install_time_clears_notified() {
        let mut app = installed("a");
        app.installed_at = None;
        let prior = TrackedApplication {
            package_id: "a".into(),
            label: "a".into(),
            last_used_at: None,
            status: UsageStatus::Rare,
            is_disabled: false,
            scheduled_disable_at: None,
            notified_at: Some(now() - Duration::days(1)),
        };
        let eval = classify(&[app], &HashMap::new(), &[prior]);
        assert_eq!(eval.updates[0].notified_at, None);
        assert_eq!(eval.updates[0].status, UsageStatus::Rare);
    }

    #[test]
    fn test_removals_and_exclusions() {
        let prior = |id: &str| TrackedApplication {
            package_id: id.into(),
            label: id.into(),
            last_used_at: None,
            status: UsageStatus::Rare,
            is_disabled: false,
            scheduled_disable_at: None,
            notified_at: None,
        };
        let mut system = installed("sys");
        system.system = true;
        let apps = vec![installed("kept"), installed("org.appfence"), system];

        let eval = classify(&apps, &HashMap::new(), &[prior("kept"), prior("gone")]);
        let ids: Vec<_> = eval.updates.iter().map(|a| a.package_id.as_str()).collect();
        assert_eq!(ids, vec!["kept"]);
        assert_eq!(eval.removals, vec!["gone".to_string()]);
    }

    struct FailingHistory;

    #[async_trait]
    impl UsageHistory for FailingHistory {
        async fn access_granted(&self) -> bool {
            true
        }

        async fn query(&self, _s: DateTime<Utc>, _e: DateTime<Utc>) -> anyhow::Result<Vec<UsageEvent>> {
            anyhow::bail!("usage service unavailable")
        }
    }

    struct StaticCatalog(Vec<InstalledApp>);

    #[async_trait]
    impl PackageCatalog for StaticCatalog {
        async fn installed(&self) -> anyhow::Result<Vec<InstalledApp>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_collect_degrades_on_history_failure() {
        let classifier = UsageClassifier::new("org.appfence");
        let catalog = StaticCatalog(vec![installed("a")]);
        let eval = classifier
            .collect(now(), &catalog, &FailingHistory, &[], &UsagePolicy::new())
            .await
            .unwrap();
        assert_eq!(eval.updates.len(), 1);
        assert_eq!(eval.updates[0].last_used_at, Some(now() - Duration::days(60)));
    }

    #[tokio::test]
    async fn test_collect_counts_only_foreground_events() {
        struct Events(Vec<UsageEvent>);

        #[async_trait]
        impl UsageHistory for Events {
            async fn access_granted(&self) -> bool {
                true
            }

            async fn query(&self, _s: DateTime<Utc>, _e: DateTime<Utc>) -> anyhow::Result<Vec<UsageEvent>> {
                Ok(self.0.clone())
            }
        }

        let history = Events(vec![
            UsageEvent {
                package_id: "a".into(),
                timestamp: now() - Duration::hours(2),
                kind: UsageEventKind::Foreground,
            },
            UsageEvent {
                package_id: "a".into(),
                timestamp: now() - Duration::minutes(1),
                kind: UsageEventKind::Background,
            },
        ]);
        let eval = UsageClassifier::new("org.appfence")
            .collect(now(), &StaticCatalog(vec![installed("a")]), &history, &[], &UsagePolicy::new())
            .await
            .unwrap();
        assert_eq!(eval.updates[0].last_used_at, Some(now() - Duration::hours(2)));
        assert_eq!(eval.updates[0].status, UsageStatus::Recent);
    }
}
