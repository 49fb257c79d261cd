//! Firewall state machine.
//!
//! States are `Disabled`, `Allowing(reactivate_at)` and `Blocking`. Every
//! transition is a persisted state write followed by a sync of the
//! enforcement surface. A write that still fails after retrying leaves
//! the in-memory state untouched, so memory and disk never diverge.
//!
//! The automatic re-block deadline is the persisted `reactivate_at`
//! itself. Re-arming it replaces the previous deadline, and any
//! transition that clears it cancels the pending re-block.

mod state;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use state::{FirewallPhase, FirewallState, JsonStateStore, StateStore};

use crate::enforcer::EnforcementSurface;
use crate::error::AppFenceError;
use crate::scheduler::Clock;
use crate::utils::saturating_add;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 100;

pub struct FirewallController {
    store: Arc<dyn StateStore>,
    surface: Arc<dyn EnforcementSurface>,
    clock: Arc<dyn Clock>,
    state: FirewallState,
    tx: watch::Sender<FirewallState>,
}

impl FirewallController {
    /// Load the persisted state and bring the enforcement surface in line
    /// with it.
    ///
    /// A persisted re-block deadline stays armed; the caller fires it
    /// immediately if it already passed.
    pub async fn restore(
        store: Arc<dyn StateStore>,
        surface: Arc<dyn EnforcementSurface>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let state = store.load().await?;
        info!(
            "Restored firewall state: {} with {} packages",
            state.phase().as_str(),
            state.blocked_packages.len()
        );
        let (tx, _) = watch::channel(state.clone());
        let controller = Self {
            store,
            surface,
            clock,
            state,
            tx,
        };
        controller.sync_surface().await;
        Ok(controller)
    }

    pub fn state(&self) -> &FirewallState {
        &self.state
    }

    pub fn phase(&self) -> FirewallPhase {
        self.state.phase()
    }

    /// Change stream of the persisted state.
    pub fn subscribe(&self) -> watch::Receiver<FirewallState> {
        self.tx.subscribe()
    }

    pub fn surface_name(&self) -> &'static str {
        self.surface.name()
    }

    /// Deadline of the scheduled automatic re-block, if any.
    pub fn pending_reblock(&self) -> Option<DateTime<Utc>> {
        match self.state.phase() {
            FirewallPhase::Allowing { reactivate_at } => reactivate_at,
            _ => None,
        }
    }

    /// Start an allow window of `allow_duration`, then block.
    pub async fn enable(&mut self, block_set: BTreeSet<String>, allow_duration: Duration) -> Result<()> {
        let reactivate_at = saturating_add(self.clock.now(), allow_duration);
        info!(
            "Enabling firewall: allowing until {} with {} packages",
            reactivate_at,
            block_set.len()
        );
        self.commit(FirewallState {
            is_enabled: true,
            is_blocking: false,
            reactivate_at: Some(reactivate_at),
            blocked_packages: block_set,
        })
        .await
    }

    /// Open (or extend) an allow window; blocking resumes at its end.
    pub async fn allow_for_duration(&mut self, allow_duration: Duration, block_set: BTreeSet<String>) -> Result<()> {
        let reactivate_at = saturating_add(self.clock.now(), allow_duration);
        if block_set.is_empty() {
            debug!("Allow window with an empty block set, delegating to set_blocking");
            return self.set_blocking(false, Some(reactivate_at), block_set).await;
        }
        info!(
            "Allowing until {}, keeping {} packages restricted",
            reactivate_at,
            block_set.len()
        );
        self.commit(FirewallState {
            is_enabled: true,
            is_blocking: false,
            reactivate_at: Some(reactivate_at),
            blocked_packages: block_set,
        })
        .await
    }

    /// Block immediately, cancelling any scheduled re-block.
    pub async fn block_now(&mut self, block_set: BTreeSet<String>) -> Result<()> {
        info!("Blocking now with {} packages", block_set.len());
        self.commit(FirewallState {
            is_enabled: true,
            is_blocking: true,
            reactivate_at: None,
            blocked_packages: block_set,
        })
        .await
    }

    /// Apply the sticky manual block list: selective, no schedule.
    pub async fn apply_manual_block_list(&mut self, block_set: BTreeSet<String>) -> Result<()> {
        let next = FirewallState {
            is_enabled: true,
            is_blocking: false,
            reactivate_at: None,
            blocked_packages: block_set,
        };
        if next == self.state {
            debug!("Manual block list unchanged ({} packages)", next.blocked_packages.len());
            self.sync_surface().await;
            return Ok(());
        }
        info!(
            "Applying manual block list: {} packages (was {})",
            next.blocked_packages.len(),
            self.state.blocked_packages.len()
        );
        self.commit(next).await
    }

    /// Turn the firewall off, cancelling any schedule and clearing the set.
    pub async fn disable(&mut self) -> Result<()> {
        info!("Disabling firewall");
        self.commit(FirewallState::default()).await
    }

    /// Enabled transition with an explicit mode and deadline.
    ///
    /// Blocking always clears the deadline.
    pub async fn set_blocking(
        &mut self,
        blocking: bool,
        reactivate_at: Option<DateTime<Utc>>,
        block_set: BTreeSet<String>,
    ) -> Result<()> {
        let reactivate_at = if blocking { None } else { reactivate_at };
        info!(
            "Setting blocking={} reactivate_at={:?} packages={}",
            blocking,
            reactivate_at,
            block_set.len()
        );
        self.commit(FirewallState {
            is_enabled: true,
            is_blocking: blocking,
            reactivate_at,
            blocked_packages: block_set,
        })
        .await
    }

    /// Replace the block set without changing mode.
    ///
    /// Returns whether anything changed. A disabled firewall keeps its
    /// empty set.
    pub async fn update_blocked_packages(&mut self, block_set: BTreeSet<String>) -> Result<bool> {
        if !self.state.is_enabled {
            debug!("Firewall disabled, ignoring block set of {} packages", block_set.len());
            return Ok(false);
        }
        if self.state.blocked_packages == block_set {
            debug!("Block set unchanged ({} packages)", block_set.len());
            return Ok(false);
        }
        info!(
            "Updating block set: {} packages (was {})",
            block_set.len(),
            self.state.blocked_packages.len()
        );
        let next = FirewallState {
            blocked_packages: block_set,
            ..self.state.clone()
        };
        self.commit(next).await?;
        Ok(true)
    }

    /// Fire the automatic re-block if its deadline has passed.
    ///
    /// Blocks with the last persisted set. Returns whether it fired.
    pub async fn fire_reblock(&mut self) -> Result<bool> {
        match self.pending_reblock() {
            Some(at) if at <= self.clock.now() => {
                info!("Allow window ended at {}, resuming blocking", at);
                let block_set = self.state.blocked_packages.clone();
                self.block_now(block_set).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Persist `next` (with retries), adopt it, then sync enforcement.
    async fn commit(&mut self, next: FirewallState) -> Result<()> {
        debug_assert!(next.is_consistent());
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_DELAY_MS * (1 << (attempt - 1));
                debug!("Retry {} of firewall state write after {}ms", attempt, delay);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            match self.store.save(&next).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!("Failed to persist firewall state (attempt {}): {:#}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            return Err(AppFenceError::Storage(format!("firewall state not persisted: {:#}", e)).into());
        }

        self.state = next;
        self.tx.send_replace(self.state.clone());
        self.sync_surface().await;
        Ok(())
    }

    /// Push the current state to the enforcement surface.
    ///
    /// Failures are logged and absorbed; the next transition retries.
    async fn sync_surface(&self) {
        let result = match self.state.enforcement() {
            Some((mode, packages)) => {
                debug!("Enforcement start: {} with {} packages", mode.as_str(), packages.len());
                self.surface.start(mode, packages).await
            }
            None => {
                debug!("Enforcement stop");
                self.surface.stop().await
            }
        };
        if let Err(e) = result {
            warn!("Enforcement surface sync failed on {}: {:#}", self.surface.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::mock::{RecordingSurface, SurfaceCall};
    use crate::enforcer::EnforcementMode;
    use crate::scheduler::ManualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// State store keeping the last saved state, failing the next
    /// `fail_next` saves.
    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<FirewallState>,
        saves: Mutex<u32>,
        fail_next: Mutex<u32>,
    }

    #[async_trait]
    impl StateStore for MemoryStore {
        async fn load(&self) -> Result<FirewallState> {
            Ok(self.saved.lock().unwrap().clone())
        }

        async fn save(&self, state: &FirewallState) -> Result<()> {
            *self.saves.lock().unwrap() += 1;
            let mut fail = self.fail_next.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                anyhow::bail!("disk full");
            }
            *self.saved.lock().unwrap() = state.clone();
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap()
    }

    fn packages(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        surface: Arc<RecordingSurface>,
        clock: Arc<ManualClock>,
        controller: FirewallController,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::default());
        let surface = Arc::new(RecordingSurface::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let controller = FirewallController::restore(store.clone(), surface.clone(), clock.clone())
            .await
            .unwrap();
        Fixture {
            store,
            surface,
            clock,
            controller,
        }
    }

    #[tokio::test]
    async fn test_enable_then_reblock_fires() {
        let mut f = fixture().await;
        let allow = Duration::milliseconds(345_600_000);
        f.controller.enable(packages(&["x", "y"]), allow).await.unwrap();

        assert_eq!(
            f.controller.phase(),
            FirewallPhase::Allowing {
                reactivate_at: Some(t0() + allow)
            }
        );
        assert_eq!(f.controller.pending_reblock(), Some(t0() + allow));
        assert_eq!(
            f.surface.last(),
            Some(SurfaceCall::Start(EnforcementMode::SelectiveAllow, packages(&["x", "y"])))
        );

        f.clock.advance(allow - Duration::seconds(1));
        assert!(!f.controller.fire_reblock().await.unwrap());

        f.clock.advance(Duration::seconds(1));
        assert!(f.controller.fire_reblock().await.unwrap());
        assert_eq!(f.controller.phase(), FirewallPhase::Blocking);
        assert_eq!(f.controller.state().blocked_packages, packages(&["x", "y"]));
        assert_eq!(f.controller.pending_reblock(), None);
        assert_eq!(
            f.surface.last(),
            Some(SurfaceCall::Start(EnforcementMode::Blocking, packages(&["x", "y"])))
        );
        assert_eq!(*f.store.saved.lock().unwrap(), f.controller.state().clone());
    }

    #[tokio::test]
    async fn test_allow_with_empty_set_stops_surface() {
        let mut f = fixture().await;
        f.controller.block_now(packages(&["x"])).await.unwrap();
        f.controller
            .allow_for_duration(Duration::hours(2), BTreeSet::new())
            .await
            .unwrap();

        let state = f.controller.state();
        assert!(state.is_enabled);
        assert!(!state.is_blocking);
        assert_eq!(state.reactivate_at, Some(t0() + Duration::hours(2)));
        assert!(state.blocked_packages.is_empty());
        assert_eq!(f.surface.last(), Some(SurfaceCall::Stop));
    }

    #[tokio::test]
    async fn test_block_now_cancels_schedule() {
        let mut f = fixture().await;
        f.controller.enable(packages(&["x"]), Duration::hours(1)).await.unwrap();
        f.controller.block_now(packages(&["x"])).await.unwrap();
        assert_eq!(f.controller.pending_reblock(), None);

        // a stale deadline passing later must not transition anything
        f.clock.advance(Duration::hours(2));
        assert!(!f.controller.fire_reblock().await.unwrap());
    }

    #[tokio::test]
    async fn test_disable_clears_everything() {
        let mut f = fixture().await;
        f.controller.enable(packages(&["x"]), Duration::hours(1)).await.unwrap();
        f.controller.disable().await.unwrap();

        assert_eq!(f.controller.state(), &FirewallState::default());
        assert_eq!(f.controller.pending_reblock(), None);
        assert_eq!(f.surface.last(), Some(SurfaceCall::Stop));
    }

    #[tokio::test]
    async fn test_update_blocked_packages_keeps_mode() {
        let mut f = fixture().await;
        f.controller.block_now(packages(&["a"])).await.unwrap();
        let calls_before = f.surface.calls().len();

        assert!(!f.controller.update_blocked_packages(packages(&["a"])).await.unwrap());
        assert_eq!(f.surface.calls().len(), calls_before);

        assert!(f.controller.update_blocked_packages(packages(&["a", "b"])).await.unwrap());
        assert_eq!(f.controller.phase(), FirewallPhase::Blocking);
        assert_eq!(
            f.surface.last(),
            Some(SurfaceCall::Start(EnforcementMode::Blocking, packages(&["a", "b"])))
        );
    }

    #[tokio::test]
    async fn test_update_blocked_packages_ignored_when_disabled() {
        let mut f = fixture().await;
        assert!(!f.controller.update_blocked_packages(packages(&["a"])).await.unwrap());
        assert!(f.controller.state().blocked_packages.is_empty());
        assert_eq!(*f.store.saves.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_manual_block_list_has_no_schedule() {
        let mut f = fixture().await;
        f.controller.enable(packages(&["x"]), Duration::hours(1)).await.unwrap();
        f.controller.apply_manual_block_list(packages(&["y"])).await.unwrap();

        assert_eq!(f.controller.phase(), FirewallPhase::Allowing { reactivate_at: None });
        assert_eq!(f.controller.pending_reblock(), None);
        assert_eq!(
            f.surface.last(),
            Some(SurfaceCall::Start(EnforcementMode::SelectiveAllow, packages(&["y"])))
        );

        let saves = *f.store.saves.lock().unwrap();
        f.controller.apply_manual_block_list(packages(&["y"])).await.unwrap();
        assert_eq!(*f.store.saves.lock().unwrap(), saves);
    }

    #[tokio::test]
    async fn test_set_blocking_normalizes_deadline() {
        let mut f = fixture().await;
        f.controller
            .set_blocking(true, Some(t0() + Duration::hours(1)), packages(&["a"]))
            .await
            .unwrap();
        assert!(f.controller.state().is_consistent());
        assert_eq!(f.controller.state().reactivate_at, None);
    }

    #[tokio::test]
    async fn test_write_retries_then_succeeds() {
        let mut f = fixture().await;
        *f.store.fail_next.lock().unwrap() = 2;
        f.controller.block_now(packages(&["a"])).await.unwrap();
        assert_eq!(*f.store.saves.lock().unwrap(), 3);
        assert_eq!(f.controller.phase(), FirewallPhase::Blocking);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_unchanged() {
        let mut f = fixture().await;
        f.controller.enable(packages(&["a"]), Duration::hours(1)).await.unwrap();
        let before = f.controller.state().clone();
        let calls_before = f.surface.calls().len();

        *f.store.fail_next.lock().unwrap() = MAX_RETRIES;
        assert!(f.controller.block_now(packages(&["a"])).await.is_err());

        assert_eq!(f.controller.state(), &before);
        assert_eq!(*f.store.saved.lock().unwrap(), before);
        assert_eq!(f.surface.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_enforcement_failure_is_absorbed() {
        let mut f = fixture().await;
        *f.surface.fail_start.lock().unwrap() = true;
        f.controller.block_now(packages(&["a"])).await.unwrap();
        assert_eq!(f.controller.phase(), FirewallPhase::Blocking);
    }

    #[tokio::test]
    async fn test_restore_keeps_persisted_deadline() {
        let store = Arc::new(MemoryStore::default());
        *store.saved.lock().unwrap() = FirewallState {
            is_enabled: true,
            is_blocking: false,
            reactivate_at: Some(t0() - Duration::minutes(1)),
            blocked_packages: packages(&["x"]),
        };
        let surface = Arc::new(RecordingSurface::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let mut controller = FirewallController::restore(store, surface.clone(), clock)
            .await
            .unwrap();

        assert_eq!(
            surface.last(),
            Some(SurfaceCall::Start(EnforcementMode::SelectiveAllow, packages(&["x"])))
        );
        assert!(controller.fire_reblock().await.unwrap());
        assert_eq!(controller.phase(), FirewallPhase::Blocking);
    }

    #[tokio::test]
    async fn test_state_stream_publishes_transitions() {
        let mut f = fixture().await;
        let mut rx = f.controller.subscribe();
        f.controller.block_now(packages(&["a"])).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_blocking);
    }
}
