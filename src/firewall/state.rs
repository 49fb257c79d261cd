//! Persisted firewall state and its store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::enforcer::EnforcementMode;
use crate::store::write_atomic;

/// What the firewall is doing, as persisted.
///
/// Enabled and not blocking is the "allowing" state: either an allow
/// window with a scheduled `reactivate_at`, or the manual block list with
/// no schedule at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallState {
    pub is_enabled: bool,
    pub is_blocking: bool,
    pub reactivate_at: Option<DateTime<Utc>>,
    pub blocked_packages: BTreeSet<String>,
}

/// Coarse state of the firewall state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallPhase {
    Disabled,
    Allowing { reactivate_at: Option<DateTime<Utc>> },
    Blocking,
}

impl FirewallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallPhase::Disabled => "disabled",
            FirewallPhase::Allowing { .. } => "allowing",
            FirewallPhase::Blocking => "blocking",
        }
    }
}

impl FirewallState {
    pub fn phase(&self) -> FirewallPhase {
        match (self.is_enabled, self.is_blocking) {
            (false, _) => FirewallPhase::Disabled,
            (true, true) => FirewallPhase::Blocking,
            (true, false) => FirewallPhase::Allowing {
                reactivate_at: self.reactivate_at,
            },
        }
    }

    /// Whether the state satisfies both persisted-state invariants.
    pub fn is_consistent(&self) -> bool {
        let blocking_ok = !self.is_blocking || self.reactivate_at.is_none();
        let disabled_ok = self.is_enabled
            || (!self.is_blocking && self.reactivate_at.is_none() && self.blocked_packages.is_empty());
        blocking_ok && disabled_ok
    }

    /// Closest consistent state, used when loading a hand-edited file.
    pub fn normalized(mut self) -> Self {
        if !self.is_enabled {
            return Self::default();
        }
        if self.is_blocking {
            self.reactivate_at = None;
        }
        self
    }

    /// Instruction for the enforcement surface; `None` means stop.
    pub fn enforcement(&self) -> Option<(EnforcementMode, &BTreeSet<String>)> {
        if !self.is_enabled {
            None
        } else if self.is_blocking {
            Some((EnforcementMode::Blocking, &self.blocked_packages))
        } else if !self.blocked_packages.is_empty() {
            Some((EnforcementMode::SelectiveAllow, &self.blocked_packages))
        } else {
            None
        }
    }
}

/// Durable storage of [`FirewallState`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<FirewallState>;

    /// Persist `state`. Either the whole state is written or nothing is.
    async fn save(&self, state: &FirewallState) -> Result<()>;
}

/// [`StateStore`] writing a JSON file atomically.
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<FirewallState> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No firewall state at {:?}, starting disabled", self.path);
                return Ok(FirewallState::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read firewall state: {:?}", self.path))
            }
        };
        let state: FirewallState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse firewall state: {:?}", self.path))?;
        if !state.is_consistent() {
            warn!("Firewall state in {:?} violates its invariants, normalizing", self.path);
        }
        Ok(state.normalized())
    }

    async fn save(&self, state: &FirewallState) -> Result<()> {
        let content = serde_json::to_string_pretty(state).context("Failed to serialize firewall state")?;
        write_atomic(self.path.clone(), content).await
    }
}
