//! Tracked application records and their durable store.
//!
//! One [`TrackedApplication`] row exists per installed, non-system,
//! non-self application. The store is a keyed JSON file; every write bumps
//! a revision published on a `watch` channel so observers can recompute
//! their derived state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

use crate::error::AppFenceError;

/// Usage tier of a tracked application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Recent,
    Rare,
    Disabled,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Recent => "recent",
            UsageStatus::Rare => "rare",
            UsageStatus::Disabled => "disabled",
        }
    }
}

/// Persisted record of one tracked application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedApplication {
    pub package_id: String,
    pub label: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub status: UsageStatus,
    /// Mirrors the platform's enabled/disabled flag.
    pub is_disabled: bool,
    /// When the disable recommendation became due.
    pub scheduled_disable_at: Option<DateTime<Utc>>,
    /// Last time a reminder or recommendation fired.
    pub notified_at: Option<DateTime<Utc>>,
}

/// Durable keyed storage for tracked applications.
#[async_trait]
pub trait AppStore: Send + Sync {
    /// Every stored row.
    async fn all(&self) -> Result<Vec<TrackedApplication>>;

    /// Rows currently in `status`.
    async fn by_status(&self, status: UsageStatus) -> Result<Vec<TrackedApplication>>;

    /// Insert or replace rows by package id.
    async fn upsert_batch(&self, apps: Vec<TrackedApplication>) -> Result<()>;

    /// Delete rows by package id. Unknown ids are ignored.
    async fn delete_batch(&self, package_ids: Vec<String>) -> Result<()>;

    /// Revision counter bumped after every successful write.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AppsFile {
    apps: BTreeMap<String, TrackedApplication>,
}

/// [`AppStore`] backed by a JSON file, cached in memory.
pub struct JsonAppStore {
    path: PathBuf,
    rows: Mutex<BTreeMap<String, TrackedApplication>>,
    revision: watch::Sender<u64>,
}

impl JsonAppStore {
    /// Open the store, loading existing rows if the file exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let rows = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read app store: {:?}", path))?;
            let file: AppsFile = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse app store: {:?}", path))?;
            file.apps
        } else {
            BTreeMap::new()
        };
        let (revision, _) = watch::channel(0);
        debug!("Opened app store {:?} with {} rows", path, rows.len());
        Ok(Self {
            path,
            rows: Mutex::new(rows),
            revision,
        })
    }

    /// Apply `change` to a copy of the rows, persist it, then swap it in.
    async fn commit<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, TrackedApplication>) -> bool,
    {
        let mut next = self.rows.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if !change(&mut next) {
            return Ok(());
        }

        let content = serde_json::to_string_pretty(&AppsFile { apps: next.clone() })
            .context("Failed to serialize app store")?;
        write_atomic(self.path.clone(), content).await?;

        *self.rows.lock().unwrap_or_else(PoisonError::into_inner) = next;
        self.revision.send_modify(|rev| *rev += 1);
        Ok(())
    }
}

#[async_trait]
impl AppStore for JsonAppStore {
    async fn all(&self) -> Result<Vec<TrackedApplication>> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.values().cloned().collect())
    }

    async fn by_status(&self, status: UsageStatus) -> Result<Vec<TrackedApplication>> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.values().filter(|a| a.status == status).cloned().collect())
    }

    async fn upsert_batch(&self, apps: Vec<TrackedApplication>) -> Result<()> {
        if apps.is_empty() {
            return Ok(());
        }
        self.commit(|rows| {
            let mut changed = false;
            for app in apps {
                if rows.get(&app.package_id) != Some(&app) {
                    rows.insert(app.package_id.clone(), app);
                    changed = true;
                }
            }
            changed
        })
        .await
    }

    async fn delete_batch(&self, package_ids: Vec<String>) -> Result<()> {
        if package_ids.is_empty() {
            return Ok(());
        }
        self.commit(|rows| {
            let before = rows.len();
            for id in &package_ids {
                rows.remove(id);
            }
            rows.len() != before
        })
        .await
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

/// Write `content` to `path` atomically (tempfile + fsync + rename) on a
/// blocking thread.
pub(crate) async fn write_atomic(path: PathBuf, content: String) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let parent = path
            .parent()
            .ok_or_else(|| AppFenceError::Storage(format!("{:?} has no parent directory", path)))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;

        let mut temp_file = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temporary file in {:?}", parent))?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(&path)
            .with_context(|| format!("Failed to persist {:?}", path))?;
        Ok(())
    })
    .await
    .context("Storage writer task panicked")?
}
