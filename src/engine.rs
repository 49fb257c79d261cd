//! The policy engine: single writer of every piece of mutable policy state.
//!
//! One task owns the thresholds, the cooldown table, the classification
//! snapshot and the [`FirewallController`]. Five event sources feed it
//! through one `select!` loop, and each event runs to completion before
//! the next is looked at:
//!
//! ```text
//!   control socket ──► commands (mpsc) ─┐
//!   settings store ──► watch ───────────┤
//!   app store ───────► revision watch ──┼──► PolicyEngine ──► FirewallController ──► EnforcementSurface
//!   interval ticker ────────────────────┤          │
//!   deadline timer (reblock, cooldowns) ┘          └──► AppStore, NoticeQueue ──► NotificationSink
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::UsageClassifier;
use crate::error::AppFenceError;
use crate::firewall::{FirewallController, FirewallState};
use crate::notify::{NoticeKind, NoticeQueue, NotificationSink, UsageNotice};
use crate::policy::{min_threshold, UsagePolicy};
use crate::resolver::{cooldown_deadline, resolve, BlockSet, ClassificationSnapshot, CooldownTable, ResolveRequest};
use crate::scheduler::{self, Clock};
use crate::settings::{Settings, SettingsStore};
use crate::signal::ShutdownToken;
use crate::sources::{PackageCatalog, UsageHistory};
use crate::store::{AppStore, TrackedApplication, UsageStatus};
use crate::utils::saturating_add;
use crate::validation::{format_interval, validate_package_id};

/// Capacity of the command queue.
const COMMAND_QUEUE: usize = 32;

/// Delay before retrying a re-block whose state write failed.
const REBLOCK_RETRY_SECS: i64 = 60;

/// Whether the usage history may be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageAccess {
    Granted,
    Ungranted,
}

/// User commands accepted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Enable,
    Disable,
    BlockNow,
    Allow,
    Unblock(String),
    SetManual(bool),
    SetAllowDuration(Duration),
    SetMetrics(bool),
    AllowlistAdd(String),
    AllowlistRemove(String),
    Refresh,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub package_id: String,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCounts {
    pub recent: usize,
    pub rare: usize,
    pub disabled: usize,
}

/// Snapshot of the engine state returned by every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub usage_access: UsageAccess,
    pub phase: String,
    pub firewall: FirewallState,
    pub backend: String,
    pub manual_mode: bool,
    pub metrics_enabled: bool,
    pub allow_duration: String,
    pub allowlist: Vec<String>,
    pub cooldowns: Vec<CooldownEntry>,
    pub apps: AppCounts,
    pub rare_apps: Vec<TrackedApplication>,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub next_wakeup: Option<DateTime<Utc>>,
}

/// Collaborators injected into the engine by the composition root.
pub struct EngineDeps {
    pub settings: Arc<SettingsStore>,
    pub store: Arc<dyn AppStore>,
    pub catalog: Arc<dyn PackageCatalog>,
    pub history: Arc<dyn UsageHistory>,
    pub notifier: Arc<dyn NotificationSink>,
    pub firewall: FirewallController,
    pub clock: Arc<dyn Clock>,
    pub self_id: String,
    pub evaluation_interval: Duration,
}

struct Envelope {
    command: EngineCommand,
    reply: oneshot::Sender<Result<StatusReport>>,
}

/// Cloneable handle used to send commands to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Envelope>,
}

impl EngineHandle {
    /// Send `command` and wait for the engine's reply.
    pub async fn send(&self, command: EngineCommand) -> Result<StatusReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { command, reply })
            .await
            .map_err(|_| AppFenceError::Control("engine has stopped".to_string()))?;
        rx.await
            .map_err(|_| AppFenceError::Control("engine dropped the command".to_string()))?
    }
}

pub struct PolicyEngine {
    settings_store: Arc<SettingsStore>,
    settings: Settings,
    store: Arc<dyn AppStore>,
    catalog: Arc<dyn PackageCatalog>,
    history: Arc<dyn UsageHistory>,
    notices: NoticeQueue,
    firewall: FirewallController,
    clock: Arc<dyn Clock>,
    self_id: String,
    evaluation_interval: Duration,
    policy: UsagePolicy,
    classifier: UsageClassifier,
    cooldowns: CooldownTable,
    snapshot: ClassificationSnapshot,
    tracked: Vec<TrackedApplication>,
    access: UsageAccess,
    last_evaluation: Option<DateTime<Utc>>,
    reblock_retry_at: Option<DateTime<Utc>>,
}

impl PolicyEngine {
    /// Build the engine from its collaborators.
    ///
    /// Loads the stored classification and checks usage access; no
    /// evaluation pass runs yet.
    pub async fn start(deps: EngineDeps) -> Result<Self> {
        let settings = deps.settings.current();
        let access = if deps.history.access_granted().await {
            UsageAccess::Granted
        } else {
            warn!("Usage access not granted, policy evaluation is suspended");
            UsageAccess::Ungranted
        };
        let tracked = match access {
            UsageAccess::Granted => deps.store.all().await.context("Failed to load tracked applications")?,
            UsageAccess::Ungranted => Vec::new(),
        };

        // the delivery task stops once the engine and its queue are dropped
        let (notices, _delivery) = NoticeQueue::spawn(deps.notifier);

        let mut engine = Self {
            settings_store: deps.settings,
            policy: UsagePolicy::with_allow_duration(settings.allow_duration),
            settings,
            store: deps.store,
            catalog: deps.catalog,
            history: deps.history,
            notices,
            firewall: deps.firewall,
            clock: deps.clock,
            classifier: UsageClassifier::new(deps.self_id.clone()),
            self_id: deps.self_id,
            evaluation_interval: deps.evaluation_interval,
            cooldowns: CooldownTable::new(),
            snapshot: ClassificationSnapshot::default(),
            tracked: Vec::new(),
            access,
            last_evaluation: None,
            reblock_retry_at: None,
        };
        engine.adopt_rows(tracked);
        info!(
            "Policy engine ready: {} tracked apps, firewall {}",
            engine.tracked.len(),
            engine.firewall.phase().as_str()
        );
        Ok(engine)
    }

    /// Run the event loop on its own task until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: ShutdownToken) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let task = tokio::spawn(self.run(rx, shutdown));
        (EngineHandle { tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Envelope>, shutdown: ShutdownToken) {
        let mut settings_rx = self.settings_store.subscribe();
        settings_rx.borrow_and_update();
        let mut store_rx = self.store.subscribe();
        store_rx.borrow_and_update();

        let period = self
            .evaluation_interval
            .max(min_threshold())
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(900));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Policy engine running, evaluating every {}", format_interval(self.evaluation_interval));
        loop {
            let deadline = self.next_wakeup();
            let clock = self.clock.clone();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = commands.recv() => match envelope {
                    Some(Envelope { command, reply }) => {
                        let result = self.handle(command).await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                Ok(()) = settings_rx.changed() => {
                    let settings = settings_rx.borrow_and_update().clone();
                    self.apply_settings(settings).await;
                }
                Ok(()) = store_rx.changed() => {
                    store_rx.borrow_and_update();
                    self.on_store_changed().await;
                }
                _ = ticker.tick() => self.refresh_logged().await,
                _ = scheduler::wait_for(deadline, clock.as_ref()) => self.on_deadline().await,
            }
        }
        info!("Policy engine stopped, enforcement left as persisted");
    }

    /// Execute one user command and report the resulting state.
    pub async fn handle(&mut self, command: EngineCommand) -> Result<StatusReport> {
        debug!("Handling command {:?}", command);
        match command {
            EngineCommand::Enable => {
                self.require_access()?;
                let block_set = self.resolve_block_set();
                if self.settings.manual_firewall_unblock {
                    self.firewall.apply_manual_block_list(block_set).await?;
                } else {
                    self.firewall.enable(block_set, self.settings.allow_duration).await?;
                }
            }
            EngineCommand::Disable => self.firewall.disable().await?,
            EngineCommand::BlockNow => {
                self.require_access()?;
                let block_set = self.resolve_block_set();
                if self.settings.manual_firewall_unblock {
                    self.firewall.apply_manual_block_list(block_set).await?;
                } else {
                    self.firewall.block_now(block_set).await?;
                }
            }
            EngineCommand::Allow => {
                if self.settings.manual_firewall_unblock {
                    return Err(AppFenceError::ManualModeActive.into());
                }
                self.require_access()?;
                let block_set = self.resolve_block_set();
                self.firewall
                    .allow_for_duration(self.settings.allow_duration, block_set)
                    .await?;
            }
            EngineCommand::Unblock(package_id) => self.manual_unblock(&package_id).await?,
            EngineCommand::SetManual(enabled) => {
                self.settings_store.set_manual_unblock(enabled).await?;
                self.sync_settings().await;
            }
            EngineCommand::SetAllowDuration(duration) => {
                self.settings_store.set_allow_duration(duration).await?;
                self.sync_settings().await;
            }
            EngineCommand::SetMetrics(enabled) => {
                self.settings_store.set_metrics_enabled(enabled).await?;
                self.sync_settings().await;
            }
            EngineCommand::AllowlistAdd(package_id) => {
                self.settings_store.allowlist_add(&package_id).await?;
                self.sync_settings().await;
            }
            EngineCommand::AllowlistRemove(package_id) => {
                self.settings_store.allowlist_remove(&package_id).await?;
                self.sync_settings().await;
            }
            EngineCommand::Refresh => self.refresh().await?,
            EngineCommand::Status => {}
        }
        Ok(self.status())
    }

    /// Exempt `package_id` from the block set until its cooldown ends.
    async fn manual_unblock(&mut self, package_id: &str) -> Result<()> {
        validate_package_id(package_id)?;
        let now = self.clock.now();
        let until = cooldown_deadline(
            now,
            self.firewall.state().reactivate_at,
            self.settings.allow_duration,
            self.block_threshold(),
        );
        info!("Manual unblock of {} until {}", package_id, until);
        self.cooldowns.insert(package_id, until);

        let mut current = self.firewall.state().blocked_packages.clone();
        if current.remove(package_id) {
            self.firewall.update_blocked_packages(current).await?;
        } else {
            debug!("{} was not in the applied block set", package_id);
        }
        Ok(())
    }

    /// One evaluation pass: classify, persist, notify, resync.
    pub async fn refresh(&mut self) -> Result<()> {
        if !self.history.access_granted().await {
            if self.access == UsageAccess::Granted {
                warn!("Usage access revoked, policy evaluation suspended");
            }
            self.access = UsageAccess::Ungranted;
            self.adopt_rows(Vec::new());
            return Err(AppFenceError::UsageAccessDenied("usage event log is not readable".to_string()).into());
        }
        if self.access == UsageAccess::Ungranted {
            info!("Usage access granted, resuming policy evaluation");
        }
        self.access = UsageAccess::Granted;

        let now = self.clock.now();
        let existing = self.store.all().await.context("Failed to read tracked applications")?;
        let evaluation = self
            .classifier
            .collect(now, self.catalog.as_ref(), self.history.as_ref(), &existing, &self.policy)
            .await?;

        if let Err(e) = self.store.upsert_batch(evaluation.updates.clone()).await {
            warn!("Failed to store {} evaluated apps: {:#}", evaluation.updates.len(), e);
        }
        if let Err(e) = self.store.delete_batch(evaluation.removals.clone()).await {
            warn!("Failed to remove {} uninstalled apps: {:#}", evaluation.removals.len(), e);
        }

        for app in &evaluation.reminders {
            self.notices.push(UsageNotice::from_app(app, NoticeKind::Reminder));
        }
        for app in &evaluation.recommendations {
            self.notices.push(UsageNotice::from_app(app, NoticeKind::Recommendation));
        }

        info!(
            "Evaluated {} apps: {} removed, {} reminders, {} recommendations",
            evaluation.updates.len(),
            evaluation.removals.len(),
            evaluation.reminders.len(),
            evaluation.recommendations.len()
        );
        self.adopt_rows(evaluation.updates);
        self.last_evaluation = Some(now);
        self.sync_block_list().await
    }

    async fn refresh_logged(&mut self) {
        match self.refresh().await {
            Ok(()) => {}
            Err(e) if self.access == UsageAccess::Ungranted => debug!("Evaluation skipped: {:#}", e),
            Err(e) => error!("Usage evaluation failed, retrying next interval: {:#}", e),
        }
    }

    /// Pick up the latest settings published by the store.
    async fn sync_settings(&mut self) {
        let settings = self.settings_store.current();
        self.apply_settings(settings).await;
    }

    /// React to a new settings snapshot. Unchanged settings are a no-op.
    pub async fn apply_settings(&mut self, next: Settings) {
        if next == self.settings {
            return;
        }
        let previous = std::mem::replace(&mut self.settings, next);
        let thresholds_changed = self.policy.update_thresholds(self.settings.allow_duration);
        let manual_changed = previous.manual_firewall_unblock != self.settings.manual_firewall_unblock;

        if previous.metrics_enabled != self.settings.metrics_enabled {
            info!(
                "Traffic metrics {}",
                if self.settings.metrics_enabled { "enabled" } else { "disabled" }
            );
        }

        if manual_changed {
            if self.settings.manual_firewall_unblock {
                info!("Manual firewall mode enabled");
                if self.firewall.state().is_enabled && self.access == UsageAccess::Granted {
                    let block_set = self.resolve_block_set();
                    if let Err(e) = self.firewall.apply_manual_block_list(block_set).await {
                        warn!("Failed to apply manual block list: {:#}", e);
                    }
                }
            } else {
                info!("Manual firewall mode disabled, clearing {} cooldowns", self.cooldowns.len());
                self.cooldowns.clear();
            }
        }

        if thresholds_changed {
            info!(
                "Allow duration now {}, re-evaluating usage",
                format_interval(self.settings.allow_duration)
            );
            self.refresh_logged().await;
        } else if let Err(e) = self.sync_block_list().await {
            warn!("Failed to resync block list: {:#}", e);
        }
    }

    /// The app store changed: rebuild the snapshot and resync.
    async fn on_store_changed(&mut self) {
        if self.access != UsageAccess::Granted {
            return;
        }
        match self.store.all().await {
            Ok(rows) => self.adopt_rows(rows),
            Err(e) => {
                warn!("Failed to reload tracked applications, keeping snapshot: {:#}", e);
                return;
            }
        }
        if let Err(e) = self.sync_block_list().await {
            warn!("Failed to resync block list: {:#}", e);
        }
    }

    /// Handle whichever deadline passed: the re-block, cooldown expiries
    /// or both.
    pub async fn on_deadline(&mut self) {
        let now = self.clock.now();

        if self.firewall.pending_reblock().is_some_and(|at| at <= now)
            && self.reblock_retry_at.map_or(true, |retry| retry <= now)
        {
            match self.firewall.fire_reblock().await {
                Ok(_) => self.reblock_retry_at = None,
                Err(e) => {
                    warn!("Automatic re-block failed, retrying in {}s: {:#}", REBLOCK_RETRY_SECS, e);
                    self.reblock_retry_at = Some(saturating_add(now, Duration::seconds(REBLOCK_RETRY_SECS)));
                }
            }
        }

        let expired = self.cooldowns.expire(now);
        if expired > 0 {
            info!("{} manual unblock cooldowns expired, resyncing", expired);
            if let Err(e) = self.sync_block_list().await {
                warn!("Failed to resync block list: {:#}", e);
            }
        }
    }

    /// Push the resolved block set to the firewall if it differs.
    async fn sync_block_list(&mut self) -> Result<()> {
        if self.access != UsageAccess::Granted {
            debug!("Usage access not granted, leaving block list untouched");
            return Ok(());
        }
        if !self.firewall.state().is_enabled {
            return Ok(());
        }
        let desired = self.resolve_block_set();
        self.firewall.update_blocked_packages(desired).await?;
        Ok(())
    }

    fn resolve_block_set(&mut self) -> BlockSet {
        let applied = self.firewall.state().blocked_packages.clone();
        let request = ResolveRequest {
            snapshot: &self.snapshot,
            manual_override: self.settings.manual_firewall_unblock,
            applied: &applied,
            now: self.clock.now(),
            block_threshold: self.block_threshold(),
            allowlist: &self.settings.allowlist,
            self_id: &self.self_id,
        };
        resolve(&request, &mut self.cooldowns)
    }

    fn block_threshold(&self) -> Duration {
        self.settings.allow_duration.max(min_threshold())
    }

    fn require_access(&self) -> Result<()> {
        match self.access {
            UsageAccess::Granted => Ok(()),
            UsageAccess::Ungranted => {
                Err(AppFenceError::UsageAccessDenied("run 'appfence refresh' once access is restored".to_string()).into())
            }
        }
    }

    fn adopt_rows(&mut self, rows: Vec<TrackedApplication>) {
        self.snapshot = ClassificationSnapshot::from_apps(&rows);
        self.tracked = rows;
    }

    /// Earliest pending deadline, honoring a failed re-block's retry delay.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let reblock = self
            .firewall
            .pending_reblock()
            .map(|at| match self.reblock_retry_at {
                Some(retry) if retry > at => retry,
                _ => at,
            });
        scheduler::next_wakeup(reblock, &self.cooldowns)
    }

    pub fn access(&self) -> UsageAccess {
        self.access
    }

    pub fn firewall(&self) -> &FirewallController {
        &self.firewall
    }

    pub fn cooldowns(&self) -> &CooldownTable {
        &self.cooldowns
    }

    pub fn status(&self) -> StatusReport {
        let count = |status: UsageStatus| self.tracked.iter().filter(|a| a.status == status).count();
        let mut rare_apps: Vec<TrackedApplication> = self
            .tracked
            .iter()
            .filter(|a| a.status == UsageStatus::Rare)
            .cloned()
            .collect();
        rare_apps.sort_by(|a, b| a.last_used_at.cmp(&b.last_used_at));

        StatusReport {
            usage_access: self.access,
            phase: self.firewall.phase().as_str().to_string(),
            firewall: self.firewall.state().clone(),
            backend: self.firewall.surface_name().to_string(),
            manual_mode: self.settings.manual_firewall_unblock,
            metrics_enabled: self.settings.metrics_enabled,
            allow_duration: format_interval(self.settings.allow_duration),
            allowlist: self.settings.allowlist.iter().cloned().collect(),
            cooldowns: self
                .cooldowns
                .entries()
                .into_iter()
                .map(|(package_id, until)| CooldownEntry { package_id, until })
                .collect(),
            apps: AppCounts {
                recent: count(UsageStatus::Recent),
                rare: count(UsageStatus::Rare),
                disabled: count(UsageStatus::Disabled),
            },
            rare_apps,
            last_evaluation: self.last_evaluation,
            next_wakeup: self.next_wakeup(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::mock::{RecordingSurface, SurfaceCall};
    use crate::enforcer::EnforcementMode;
    use crate::firewall::{FirewallPhase, StateStore};
    use crate::scheduler::ManualClock;
    use crate::sources::{InstalledApp, UsageEvent, UsageEventKind};
    use crate::store::JsonAppStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const SELF_ID: &str = "org.appfence";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct FakeCatalog {
        apps: Mutex<Vec<InstalledApp>>,
    }

    #[async_trait]
    impl PackageCatalog for FakeCatalog {
        async fn installed(&self) -> Result<Vec<InstalledApp>> {
            Ok(self.apps.lock().unwrap().clone())
        }
    }

    struct FakeHistory {
        granted: Mutex<bool>,
        events: Mutex<Vec<UsageEvent>>,
    }

    #[async_trait]
    impl UsageHistory for FakeHistory {
        async fn access_granted(&self) -> bool {
            *self.granted.lock().unwrap()
        }

        async fn query(&self, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<Vec<UsageEvent>> {
            Ok(self.events.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<UsageNotice>>,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl NotificationSink for RecordingNotifier {
        async fn notify(&self, notice: &UsageNotice) {
            tokio::time::sleep(self.delay).await;
            self.notices.lock().unwrap().push(notice.clone());
        }
    }

    impl RecordingNotifier {
        /// Wait until the delivery task has handed over `count` notices.
        async fn delivered(&self, count: usize) -> Vec<UsageNotice> {
            let wait = async {
                loop {
                    let notices = self.notices.lock().unwrap().clone();
                    if notices.len() >= count {
                        return notices;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            };
            tokio::time::timeout(std::time::Duration::from_secs(5), wait)
                .await
                .expect("notices were not delivered")
        }
    }

    #[derive(Default)]
    struct MemoryState(Mutex<FirewallState>);

    #[async_trait]
    impl StateStore for MemoryState {
        async fn load(&self) -> Result<FirewallState> {
            Ok(self.0.lock().unwrap().clone())
        }

        async fn save(&self, state: &FirewallState) -> Result<()> {
            *self.0.lock().unwrap() = state.clone();
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        catalog: Arc<FakeCatalog>,
        history: Arc<FakeHistory>,
        notifier: Arc<RecordingNotifier>,
        surface: Arc<RecordingSurface>,
        engine: PolicyEngine,
    }

    fn app(id: &str, installed_days_ago: i64) -> InstalledApp {
        InstalledApp {
            package_id: id.to_string(),
            label: id.to_string(),
            uid: None,
            installed_at: Some(t0() - Duration::days(installed_days_ago)),
            updated_at: None,
            disabled: false,
            system: false,
        }
    }

    fn foreground(id: &str, ago: Duration) -> UsageEvent {
        UsageEvent {
            package_id: id.to_string(),
            timestamp: t0() - ago,
            kind: UsageEventKind::Foreground,
        }
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    async fn harness(apps: Vec<InstalledApp>, events: Vec<UsageEvent>, settings: Settings) -> Harness {
        harness_with_notifier(apps, events, settings, Arc::new(RecordingNotifier::default())).await
    }

    async fn harness_with_notifier(
        apps: Vec<InstalledApp>,
        events: Vec<UsageEvent>,
        settings: Settings,
        notifier: Arc<RecordingNotifier>,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let catalog = Arc::new(FakeCatalog {
            apps: Mutex::new(apps),
        });
        let history = Arc::new(FakeHistory {
            granted: Mutex::new(true),
            events: Mutex::new(events),
        });
        let surface = Arc::new(RecordingSurface::new());
        let firewall = FirewallController::restore(Arc::new(MemoryState::default()), surface.clone(), clock.clone())
            .await
            .unwrap();
        let engine = PolicyEngine::start(EngineDeps {
            settings: Arc::new(SettingsStore::in_memory(settings).unwrap()),
            store: Arc::new(JsonAppStore::open(dir.path().join("apps.json")).unwrap()),
            catalog: catalog.clone(),
            history: history.clone(),
            notifier: notifier.clone(),
            firewall,
            clock: clock.clone(),
            self_id: SELF_ID.to_string(),
            evaluation_interval: Duration::minutes(15),
        })
        .await
        .unwrap();
        Harness {
            _dir: dir,
            clock,
            catalog,
            history,
            notifier,
            surface,
            engine,
        }
    }

    fn standard_apps() -> (Vec<InstalledApp>, Vec<UsageEvent>) {
        (
            vec![app("used", 30), app("stale", 30), app(SELF_ID, 30)],
            vec![foreground("used", Duration::hours(1)), foreground("stale", Duration::days(5))],
        )
    }

    #[tokio::test]
    async fn test_refresh_classifies_and_notifies() {
        let (apps, events) = standard_apps();
        let mut h = harness(apps, events, Settings::default()).await;
        h.engine.refresh().await.unwrap();

        let status = h.engine.status();
        assert_eq!(status.apps.recent, 1);
        assert_eq!(status.apps.rare, 1);
        assert_eq!(status.rare_apps[0].package_id, "stale");

        let notices = h.notifier.delivered(1).await;
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].package_id, "stale");
        assert_eq!(notices[0].kind, NoticeKind::Recommendation);
    }

    #[tokio::test]
    async fn test_refresh_does_not_wait_for_slow_notifications() {
        let apps = (0..20).map(|i| app(&format!("idle{}", i), 30)).collect();
        let notifier = Arc::new(RecordingNotifier {
            delay: std::time::Duration::from_secs(30),
            ..Default::default()
        });
        let mut h = harness_with_notifier(apps, Vec::new(), Settings::default(), notifier).await;

        tokio::time::timeout(std::time::Duration::from_secs(2), h.engine.refresh())
            .await
            .expect("refresh blocked on notification delivery")
            .unwrap();
        assert_eq!(h.engine.status().apps.rare, 20);
        assert!(h.notifier.notices.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enable_uses_resolved_set() {
        let (apps, events) = standard_apps();
        let mut h = harness(apps, events, Settings::default()).await;
        h.engine.refresh().await.unwrap();

        let status = h.engine.handle(EngineCommand::Enable).await.unwrap();
        assert_eq!(status.firewall.blocked_packages, set(&["stale"]));
        assert_eq!(status.firewall.reactivate_at, Some(t0() + Duration::days(4)));
        assert_eq!(status.next_wakeup, Some(t0() + Duration::days(4)));
    }

    #[tokio::test]
    async fn test_usage_ungranted_short_circuits() {
        let (apps, events) = standard_apps();
        let mut h = harness(apps, events, Settings::default()).await;
        h.engine.refresh().await.unwrap();
        h.engine.handle(EngineCommand::BlockNow).await.unwrap();
        let calls = h.surface.calls().len();

        *h.history.granted.lock().unwrap() = false;
        let err = h.engine.refresh().await.unwrap_err();
        assert!(err.downcast_ref::<AppFenceError>().is_some());
        assert_eq!(h.engine.access(), UsageAccess::Ungranted);
        assert_eq!(h.engine.status().apps, AppCounts::default());

        // no enforcement change, commands needing classification refused
        assert_eq!(h.surface.calls().len(), calls);
        assert!(h.engine.handle(EngineCommand::Enable).await.is_err());
        assert_eq!(h.engine.firewall().phase(), FirewallPhase::Blocking);
    }

    #[tokio::test]
    async fn test_allow_refused_in_manual_mode() {
        let settings = Settings {
            manual_firewall_unblock: true,
            ..Settings::default()
        };
        let mut h = harness(Vec::new(), Vec::new(), settings).await;
        let err = h.engine.handle(EngineCommand::Allow).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AppFenceError>(),
            Some(AppFenceError::ManualModeActive)
        ));
    }

    #[tokio::test]
    async fn test_manual_unblock_and_cooldown_expiry() {
        let (apps, events) = standard_apps();
        let settings = Settings {
            manual_firewall_unblock: true,
            ..Settings::default()
        };
        let mut h = harness(apps, events, settings).await;
        h.engine.refresh().await.unwrap();
        h.engine.handle(EngineCommand::Enable).await.unwrap();
        assert_eq!(h.engine.firewall().state().blocked_packages, set(&["stale"]));

        let status = h.engine.handle(EngineCommand::Unblock("stale".into())).await.unwrap();
        assert!(status.firewall.blocked_packages.is_empty());
        assert_eq!(status.cooldowns[0].until, t0() + Duration::days(4));
        assert_eq!(status.next_wakeup, Some(t0() + Duration::days(4)));

        // an evaluation pass before expiry keeps it out
        h.clock.advance(Duration::days(1));
        h.engine.refresh().await.unwrap();
        assert!(h.engine.firewall().state().blocked_packages.is_empty());

        h.clock.advance(Duration::days(3));
        h.engine.on_deadline().await;
        assert!(h.engine.cooldowns().is_empty());
        assert_eq!(h.engine.firewall().state().blocked_packages, set(&["stale"]));
        assert_eq!(h.engine.next_wakeup(), None);
    }

    #[tokio::test]
    async fn test_manual_off_clears_cooldowns_and_resyncs() {
        let (apps, events) = standard_apps();
        let settings = Settings {
            manual_firewall_unblock: true,
            ..Settings::default()
        };
        let mut h = harness(apps, events, settings).await;
        h.engine.refresh().await.unwrap();
        h.engine.handle(EngineCommand::Enable).await.unwrap();
        h.engine.handle(EngineCommand::Unblock("stale".into())).await.unwrap();
        assert_eq!(h.engine.cooldowns().len(), 1);

        let status = h.engine.handle(EngineCommand::SetManual(false)).await.unwrap();
        assert!(!status.manual_mode);
        assert!(status.cooldowns.is_empty());
        assert_eq!(status.firewall.blocked_packages, set(&["stale"]));
    }

    #[tokio::test]
    async fn test_manual_on_applies_sticky_list_only_when_enabled() {
        let (apps, events) = standard_apps();
        let mut h = harness(apps, events, Settings::default()).await;
        h.engine.refresh().await.unwrap();

        h.engine.handle(EngineCommand::SetManual(true)).await.unwrap();
        assert_eq!(h.engine.firewall().phase(), FirewallPhase::Disabled);

        h.engine.handle(EngineCommand::SetManual(false)).await.unwrap();
        h.engine.handle(EngineCommand::Enable).await.unwrap();
        h.engine.handle(EngineCommand::SetManual(true)).await.unwrap();
        assert_eq!(
            h.engine.firewall().phase(),
            FirewallPhase::Allowing { reactivate_at: None }
        );
        assert_eq!(
            h.surface.last(),
            Some(SurfaceCall::Start(EnforcementMode::SelectiveAllow, set(&["stale"])))
        );
    }

    #[tokio::test]
    async fn test_manual_mode_round_trip_reproduces_block_set() {
        let (mut apps, events) = standard_apps();
        let mut off = app("off", 30);
        off.disabled = true;
        apps.push(off);
        let mut h = harness(apps, events, Settings::default()).await;
        h.engine.refresh().await.unwrap();
        h.engine.handle(EngineCommand::Enable).await.unwrap();

        let first = h.engine.handle(EngineCommand::SetManual(true)).await.unwrap();
        assert_eq!(first.firewall.blocked_packages, set(&["off", "stale"]));
        let first_call = h.surface.last();

        h.engine.handle(EngineCommand::SetManual(false)).await.unwrap();
        let second = h.engine.handle(EngineCommand::SetManual(true)).await.unwrap();

        assert_eq!(second.firewall.blocked_packages, first.firewall.blocked_packages);
        assert_eq!(second.firewall.is_blocking, first.firewall.is_blocking);
        assert_eq!(h.surface.last(), first_call);
    }

    #[tokio::test]
    async fn test_oversized_allow_duration_rejected() {
        let (apps, events) = standard_apps();
        let mut h = harness(apps, events, Settings::default()).await;
        h.engine.refresh().await.unwrap();
        h.engine.handle(EngineCommand::Enable).await.unwrap();

        let err = h
            .engine
            .handle(EngineCommand::SetAllowDuration(Duration::days(100_000_000)))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AppFenceError>(),
            Some(AppFenceError::InvalidDuration(_))
        ));

        let status = h.engine.handle(EngineCommand::Refresh).await.unwrap();
        assert_eq!(status.allow_duration, "4d");
        assert_eq!(status.firewall.reactivate_at, Some(t0() + Duration::days(4)));
    }

    #[tokio::test]
    async fn test_duration_change_reevaluates_only_when_thresholds_move() {
        let (apps, events) = standard_apps();
        let mut h = harness(apps, events, Settings::default()).await;
        h.engine.refresh().await.unwrap();
        let first = h.engine.status().last_evaluation;

        h.clock.advance(Duration::minutes(1));
        h.engine.handle(EngineCommand::SetAllowDuration(Duration::days(4))).await.unwrap();
        assert_eq!(h.engine.status().last_evaluation, first);

        h.engine.handle(EngineCommand::SetAllowDuration(Duration::days(7))).await.unwrap();
        assert_eq!(h.engine.status().last_evaluation, Some(t0() + Duration::minutes(1)));
        assert_eq!(h.engine.status().allow_duration, "7d");
    }

    #[tokio::test]
    async fn test_allowlist_removes_from_block_set() {
        let (apps, events) = standard_apps();
        let mut h = harness(apps, events, Settings::default()).await;
        h.engine.refresh().await.unwrap();
        h.engine.handle(EngineCommand::BlockNow).await.unwrap();

        let status = h.engine.handle(EngineCommand::AllowlistAdd("stale".into())).await.unwrap();
        assert!(status.firewall.blocked_packages.is_empty());
        assert_eq!(status.allowlist, vec!["stale".to_string()]);

        let status = h.engine.handle(EngineCommand::AllowlistRemove("stale".into())).await.unwrap();
        assert_eq!(status.firewall.blocked_packages, set(&["stale"]));
    }

    #[tokio::test]
    async fn test_uninstalled_app_leaves_block_set() {
        let (apps, events) = standard_apps();
        let mut h = harness(apps, events, Settings::default()).await;
        h.engine.refresh().await.unwrap();
        h.engine.handle(EngineCommand::BlockNow).await.unwrap();

        h.catalog.apps.lock().unwrap().retain(|a| a.package_id != "stale");
        h.engine.refresh().await.unwrap();
        assert!(h.engine.firewall().state().blocked_packages.is_empty());
        assert_eq!(h.engine.status().apps.rare, 0);
    }

    #[tokio::test]
    async fn test_reblock_deadline_fires() {
        let (apps, events) = standard_apps();
        let mut h = harness(apps, events, Settings::default()).await;
        h.engine.refresh().await.unwrap();
        h.engine.handle(EngineCommand::Allow).await.unwrap();

        h.clock.advance(Duration::days(4));
        h.engine.on_deadline().await;
        assert_eq!(h.engine.firewall().phase(), FirewallPhase::Blocking);
        assert_eq!(h.engine.next_wakeup(), None);
    }
}
