//! Platform data sources: the installed package catalog and usage history.
//!
//! Both are fed by an external agent that snapshots the platform: an
//! inventory YAML file listing installed applications and an append-only
//! JSON-lines log of usage events.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How far back the usage history is queried.
pub fn usage_lookback() -> Duration {
    Duration::days(30)
}

/// One installed application as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApp {
    pub package_id: String,
    #[serde(default)]
    pub label: String,
    /// Numeric identity used by the enforcement backend.
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub installed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub system: bool,
}

impl InstalledApp {
    /// Fallback "last used" time for an app that was never observed.
    pub fn install_fallback(&self) -> Option<DateTime<Utc>> {
        match (self.installed_at, self.updated_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Display label, falling back to the package id.
    pub fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.package_id
        } else {
            &self.label
        }
    }
}

/// Kind of a usage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageEventKind {
    Foreground,
    Resumed,
    Background,
    #[serde(other)]
    Other,
}

/// One usage transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub package_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: UsageEventKind,
}

/// Enumerates installed applications.
#[async_trait]
pub trait PackageCatalog: Send + Sync {
    /// Installed, non-system applications.
    async fn installed(&self) -> Result<Vec<InstalledApp>>;
}

/// Source of foreground usage events.
#[async_trait]
pub trait UsageHistory: Send + Sync {
    /// Whether the usage history may be read at all.
    async fn access_granted(&self) -> bool;

    /// Events with `start <= timestamp <= end`, oldest first.
    async fn query(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<UsageEvent>>;
}

/// Most recent foreground timestamp per package.
///
/// Only foreground and resumed events count. Events for `self_id` and
/// blank package ids are ignored.
pub fn last_foreground_times(events: &[UsageEvent], self_id: &str) -> HashMap<String, DateTime<Utc>> {
    let mut map: HashMap<String, DateTime<Utc>> = HashMap::new();
    for event in events {
        if !matches!(event.kind, UsageEventKind::Foreground | UsageEventKind::Resumed) {
            continue;
        }
        let id = event.package_id.trim();
        if id.is_empty() || id == self_id {
            continue;
        }
        map.entry(id.to_string())
            .and_modify(|ts| {
                if event.timestamp > *ts {
                    *ts = event.timestamp;
                }
            })
            .or_insert(event.timestamp);
    }
    map
}

#[derive(Debug, Default, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    apps: Vec<InstalledApp>,
}

/// [`PackageCatalog`] reading an inventory YAML file.
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn load(&self) -> Result<Vec<InstalledApp>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read inventory: {:?}", self.path))?;
        let inventory: InventoryFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse inventory: {:?}", self.path))?;
        Ok(inventory.apps)
    }
}

#[async_trait]
impl PackageCatalog for FileCatalog {
    async fn installed(&self) -> Result<Vec<InstalledApp>> {
        let apps = self.load().await?;
        let total = apps.len();
        let user_apps: Vec<InstalledApp> = apps.into_iter().filter(|a| !a.system).collect();
        debug!("Inventory lists {} apps ({} non-system)", total, user_apps.len());
        Ok(user_apps)
    }
}

/// [`UsageHistory`] reading a JSON-lines event log.
pub struct FileUsageHistory {
    path: PathBuf,
}

impl FileUsageHistory {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl UsageHistory for FileUsageHistory {
    async fn access_granted(&self) -> bool {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn query(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<UsageEvent>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read usage events: {:?}", self.path))?;

        let mut events = Vec::new();
        let mut skipped = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<UsageEvent>(line) {
                Ok(event) if event.timestamp >= start && event.timestamp <= end => events.push(event),
                Ok(_) => {}
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("Skipped {} malformed usage event lines", skipped);
        }
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}
