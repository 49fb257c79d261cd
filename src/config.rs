//! Configuration management for AppFence.

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::AppFenceError;
use crate::validation::{parse_interval, validate_package_id};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/appfence/config.yaml";

/// Environment variable overriding the webhook token.
const WEBHOOK_TOKEN_ENV: &str = "APPFENCE_WEBHOOK_TOKEN";

/// Secure string type that zeroizes memory on drop.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Package id of the agent itself, never tracked nor blocked
    pub self_id: String,

    /// Enforcement backend (nftables, log)
    pub backend: Backend,

    /// Unused time before an app is blocked, also the allow window length
    pub allow_duration: String,

    /// Sticky, user-curated block list
    pub manual_firewall_unblock: bool,

    /// Traffic metrics collection flag
    pub metrics_enabled: bool,

    /// Package ids that are never blocked
    pub allowlist: Vec<String>,

    /// Periodic usage re-evaluation interval
    pub evaluation_interval: String,

    pub paths: PathsConfig,

    pub notifications: NotificationsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            self_id: "org.appfence".to_string(),
            backend: Backend::default(),
            allow_duration: "4d".to_string(),
            manual_firewall_unblock: false,
            metrics_enabled: false,
            allowlist: Vec::new(),
            evaluation_interval: "15m".to_string(),
            paths: PathsConfig::default(),
            notifications: NotificationsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, err: anyhow::Error| AppFenceError::Config(format!("{}: {:#}", field, err));

        validate_package_id(&self.self_id).map_err(|e| invalid("self_id", e))?;

        parse_interval(&self.allow_duration).map_err(|e| invalid("allow_duration", e))?;
        parse_interval(&self.evaluation_interval).map_err(|e| invalid("evaluation_interval", e))?;

        for package_id in &self.allowlist {
            validate_package_id(package_id).map_err(|e| invalid("allowlist", e))?;
        }

        let webhook = &self.notifications.webhook;
        if webhook.enabled && !webhook.url.starts_with("https://") {
            return Err(AppFenceError::Config(format!(
                "Webhook URL must use HTTPS: {}",
                webhook.url
            ))
            .into());
        }

        Ok(())
    }

    /// Parsed allow duration.
    pub fn allow_duration(&self) -> Result<Duration> {
        parse_interval(&self.allow_duration)
    }

    /// Parsed evaluation interval.
    pub fn evaluation_interval(&self) -> Result<Duration> {
        parse_interval(&self.evaluation_interval)
    }

    /// Save configuration to YAML file atomically
    ///
    /// Uses tempfile + rename pattern to prevent corruption on crash.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let path = path.as_ref();
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        let parent_dir = path.parent().unwrap_or(Path::new("/etc/appfence"));
        std::fs::create_dir_all(parent_dir)
            .with_context(|| format!("Failed to create config directory {:?}", parent_dir))?;
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for config")?;

        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;

        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist config file: {:?}", path))?;

        Ok(())
    }

    /// Generate default config with comments
    pub fn generate_default_yaml() -> String {
        include_str!("../templates/config.yaml").to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Per-uid egress filtering through nftables
    #[default]
    Nftables,
    /// Log instructions only (dry run)
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding firewall.json and apps.json
    pub state_dir: PathBuf,
    /// Installed application inventory (YAML)
    pub inventory: PathBuf,
    /// Usage event log (JSON lines)
    pub usage_events: PathBuf,
    /// Control socket of the daemon
    pub socket: PathBuf,
    pub lock_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/appfence"),
            inventory: PathBuf::from("/var/lib/appfence/inventory.yaml"),
            usage_events: PathBuf::from("/var/lib/appfence/usage.jsonl"),
            socket: PathBuf::from("/run/appfence.sock"),
            lock_file: PathBuf::from("/run/appfence.lock"),
        }
    }
}

impl PathsConfig {
    pub fn firewall_state(&self) -> PathBuf {
        self.state_dir.join("firewall.json")
    }

    pub fn app_store(&self) -> PathBuf {
        self.state_dir.join("apps.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotificationsConfig {
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    #[serde(deserialize_with = "deserialize_headers")]
    pub headers: HashMap<String, String>,
    /// Bearer token, overridden by APPFENCE_WEBHOOK_TOKEN
    pub token: SecureString,
}

impl WebhookConfig {
    /// Effective token: environment first, then the config value.
    pub fn get_token(&self) -> SecureString {
        if let Ok(val) = env::var(WEBHOOK_TOKEN_ENV) {
            return SecureString::new(val);
        }
        self.token.clone()
    }
}

/// Deserialize and validate HTTP headers (reject injection attempts)
fn deserialize_headers<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let headers: HashMap<String, String> = HashMap::deserialize(deserializer)?;

    for (key, value) in &headers {
        if key.contains('\r') || key.contains('\n') || value.contains('\r') || value.contains('\n') {
            return Err(serde::de::Error::custom(format!(
                "Invalid header '{}': contains newline characters",
                key.escape_debug()
            )));
        }
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || "-_".contains(c)) {
            return Err(serde::de::Error::custom(format!(
                "Invalid header name '{}': contains invalid characters",
                key
            )));
        }
    }

    Ok(headers)
}
