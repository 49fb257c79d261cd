//! User settings store with a change stream.
//!
//! Wraps the YAML configuration file. Every setter validates first, then
//! persists atomically, then publishes the new [`Settings`] snapshot. An
//! invalid value is rejected before anything is written.

use anyhow::{Context, Result};
use chrono::Duration;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::AppFenceError;
use crate::validation::{format_interval, max_interval, validate_package_id, MAX_INTERVAL_DAYS};

/// Snapshot of the user-facing settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub allow_duration: Duration,
    pub manual_firewall_unblock: bool,
    pub metrics_enabled: bool,
    pub allowlist: BTreeSet<String>,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            allow_duration: config.allow_duration()?,
            manual_firewall_unblock: config.manual_firewall_unblock,
            metrics_enabled: config.metrics_enabled,
            allowlist: config.allowlist.iter().cloned().collect(),
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            allow_duration: Duration::days(4),
            manual_firewall_unblock: false,
            metrics_enabled: false,
            allowlist: BTreeSet::new(),
        }
    }
}

pub struct SettingsStore {
    /// `None` keeps the settings in memory only.
    path: Option<PathBuf>,
    config: Mutex<Config>,
    tx: watch::Sender<Settings>,
}

impl SettingsStore {
    pub fn new(config: Config, path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;
        let settings = Settings::from_config(&config)?;
        let (tx, _) = watch::channel(settings);
        Ok(Self {
            path,
            config: Mutex::new(config),
            tx,
        })
    }

    /// In-memory store seeded with `settings`.
    pub fn in_memory(settings: Settings) -> Result<Self> {
        let config = Config {
            allow_duration: format_interval(settings.allow_duration),
            manual_firewall_unblock: settings.manual_firewall_unblock,
            metrics_enabled: settings.metrics_enabled,
            allowlist: settings.allowlist.into_iter().collect(),
            ..Config::default()
        };
        Self::new(config, None)
    }

    pub fn current(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// Change stream of settings snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    pub async fn set_allow_duration(&self, duration: Duration) -> Result<bool> {
        if duration <= Duration::zero() {
            return Err(AppFenceError::InvalidDuration(format!(
                "allow duration must be positive, got {}s",
                duration.num_seconds()
            ))
            .into());
        }
        if duration > max_interval() {
            return Err(AppFenceError::InvalidDuration(format!(
                "allow duration must not exceed {}d, got {}",
                MAX_INTERVAL_DAYS,
                format_interval(duration)
            ))
            .into());
        }
        let interval = format_interval(duration);
        self.update(|config| {
            if config.allow_duration == interval {
                return false;
            }
            config.allow_duration = interval;
            true
        })
        .await
    }

    pub async fn set_manual_unblock(&self, enabled: bool) -> Result<bool> {
        self.update(|config| {
            std::mem::replace(&mut config.manual_firewall_unblock, enabled) != enabled
        })
        .await
    }

    pub async fn set_metrics_enabled(&self, enabled: bool) -> Result<bool> {
        self.update(|config| std::mem::replace(&mut config.metrics_enabled, enabled) != enabled)
            .await
    }

    pub async fn allowlist_add(&self, package_id: &str) -> Result<bool> {
        validate_package_id(package_id)?;
        self.update(|config| {
            if config.allowlist.iter().any(|p| p == package_id) {
                return false;
            }
            config.allowlist.push(package_id.to_string());
            config.allowlist.sort();
            true
        })
        .await
    }

    pub async fn allowlist_remove(&self, package_id: &str) -> Result<bool> {
        self.update(|config| {
            let before = config.allowlist.len();
            config.allowlist.retain(|p| p != package_id);
            config.allowlist.len() != before
        })
        .await
    }

    /// Apply `change` to a copy of the config; validate, persist and
    /// publish it when it reports a modification.
    async fn update<F>(&self, change: F) -> Result<bool>
    where
        F: FnOnce(&mut Config) -> bool,
    {
        let mut guard = self.config.lock().await;
        let mut next = guard.clone();
        if !change(&mut next) {
            debug!("Settings unchanged");
            return Ok(false);
        }
        next.validate()?;
        let settings = Settings::from_config(&next)?;

        if let Some(path) = &self.path {
            let path = path.clone();
            let to_save = next.clone();
            tokio::task::spawn_blocking(move || to_save.save(&path))
                .await
                .context("Settings writer task panicked")??;
        }

        *guard = next;
        info!(
            "Settings updated: allow_duration={} manual={} metrics={} allowlist={}",
            format_interval(settings.allow_duration),
            settings.manual_firewall_unblock,
            settings.metrics_enabled,
            settings.allowlist.len()
        );
        self.tx.send_replace(settings);
        Ok(true)
    }
}
