//! # AppFence - usage-driven per-application network firewall
//!
//! Applications that have not been in the foreground for a configurable
//! period ("allow duration") lose network access. Using them again, or
//! explicitly unblocking them, restores it.
//!
//! ## Features
//!
//! - **Usage tiers** - every installed app is RECENT, RARE or DISABLED
//! - **Allow windows** - temporary full access that re-blocks on its own
//! - **Manual mode** - a sticky block list with per-app unblock cooldowns
//! - **Durable state** - firewall state survives restarts, written atomically
//! - **nftables backend** - per-uid egress filtering in its own table
//! - **Notifications** - reminders and disable recommendations via webhook
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        AppFence                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap) ──► control socket (JSON lines) ──┐             │
//! ├───────────────────────────────────────────────┼─────────────┤
//! │  PolicyEngine (single writer, tokio::select!) ◄┘            │
//! │    ├── UsageClassifier + UsagePolicy thresholds             │
//! │    ├── Block-list resolver + cooldown table                 │
//! │    └── Deadline timer (re-block, cooldown expiry)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  FirewallController (Disabled / Allowing / Blocking)        │
//! │    └── EnforcementSurface: nftables | log                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Stores: settings (YAML), apps + firewall state (JSON)      │
//! │  Sources: package inventory (YAML), usage events (JSONL)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use appfence::config::Backend;
//! use appfence::enforcer::create_surface;
//! use appfence::engine::{EngineCommand, EngineDeps, PolicyEngine};
//! use appfence::firewall::{FirewallController, JsonStateStore};
//! use appfence::notify::Notifier;
//! use appfence::scheduler::SystemClock;
//! use appfence::settings::{Settings, SettingsStore};
//! use appfence::signal::ShutdownToken;
//! use appfence::sources::{FileCatalog, FileUsageHistory, PackageCatalog};
//! use appfence::store::JsonAppStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let catalog: Arc<dyn PackageCatalog> = Arc::new(FileCatalog::new("/tmp/inventory.yaml"));
//!     let surface = create_surface(Backend::Log, catalog.clone(), "org.appfence");
//!     let clock = Arc::new(SystemClock);
//!     let firewall = FirewallController::restore(
//!         Arc::new(JsonStateStore::new("/tmp/firewall.json")),
//!         surface,
//!         clock.clone(),
//!     )
//!     .await?;
//!
//!     let engine = PolicyEngine::start(EngineDeps {
//!         settings: Arc::new(SettingsStore::in_memory(Settings::default())?),
//!         store: Arc::new(JsonAppStore::open("/tmp/apps.json")?),
//!         catalog,
//!         history: Arc::new(FileUsageHistory::new("/tmp/usage.jsonl")),
//!         notifier: Arc::new(Notifier::new(Default::default())?),
//!         firewall,
//!         clock,
//!         self_id: "org.appfence".to_string(),
//!         evaluation_interval: chrono::Duration::minutes(15),
//!     })
//!     .await?;
//!
//!     let (handle, _task) = engine.spawn(ShutdownToken::new());
//!     let status = handle.send(EngineCommand::Enable).await?;
//!     println!("{} apps restricted", status.firewall.blocked_packages.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`classifier`] - Usage classification and notification triggers
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - Mockable external command execution
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`control`] - Daemon control socket and client
//! - [`enforcer`] - Enforcement backends (nftables, log)
//! - [`engine`] - Policy engine event loop and user commands
//! - [`firewall`] - Firewall state machine and its persistence
//! - [`lock`] - Single-instance lock
//! - [`notify`] - Usage notifications
//! - [`policy`] - Thresholds derived from the allow duration
//! - [`resolver`] - Block-list resolution and unblock cooldowns
//! - [`scheduler`] - Clock abstraction and deadline timer
//! - [`settings`] - Persisted user settings with a change stream
//! - [`signal`] - Graceful shutdown signal handling
//! - [`sources`] - Package inventory and usage history sources
//! - [`store`] - Tracked application store
//! - [`utils`] - Common utility functions (formatting, truncation)

pub mod classifier;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod control;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod lock;
pub mod notify;
pub mod policy;
pub mod resolver;
pub mod scheduler;
pub mod settings;
pub mod signal;
pub mod sources;
pub mod store;
pub mod utils;
pub mod validation;

pub use cli::{AllowlistAction, Cli, Commands};
pub use config::Config;
pub use error::AppFenceError;
