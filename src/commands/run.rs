//! Daemon entry point: wires every component together and runs until
//! SIGINT/SIGTERM.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Backend, Config};
use crate::control::ControlServer;
use crate::enforcer::{check_root, create_surface};
use crate::engine::{EngineDeps, PolicyEngine};
use crate::firewall::{FirewallController, JsonStateStore};
use crate::lock::LockGuard;
use crate::notify::Notifier;
use crate::scheduler::SystemClock;
use crate::settings::SettingsStore;
use crate::signal::{listen_for_signals, ShutdownToken};
use crate::sources::{FileCatalog, FileUsageHistory, PackageCatalog};
use crate::store::JsonAppStore;

/// Run the daemon in the foreground
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    if !config_path.exists() {
        warn!("No config at {:?}, running with defaults", config_path);
    }
    if config.backend == Backend::Nftables {
        check_root()?;
    }

    let _lock = LockGuard::acquire(&config.paths.lock_file)?;
    let evaluation_interval = config.evaluation_interval()?;

    let catalog: Arc<dyn PackageCatalog> = Arc::new(FileCatalog::new(&config.paths.inventory));
    let history = Arc::new(FileUsageHistory::new(&config.paths.usage_events));
    let store = Arc::new(
        JsonAppStore::open(config.paths.app_store()).context("Failed to open tracked application store")?,
    );
    let surface = create_surface(config.backend, catalog.clone(), &config.self_id);
    let notifier = Arc::new(Notifier::new(config.notifications.webhook.clone())?);
    let clock = Arc::new(SystemClock);

    let firewall = FirewallController::restore(
        Arc::new(JsonStateStore::new(config.paths.firewall_state())),
        surface,
        clock.clone(),
    )
    .await
    .context("Failed to restore firewall state")?;

    let socket_path = config.paths.socket.clone();
    let self_id = config.self_id.clone();
    let settings = Arc::new(SettingsStore::new(config, Some(config_path.to_path_buf()))?);

    let engine = PolicyEngine::start(EngineDeps {
        settings,
        store,
        catalog,
        history,
        notifier,
        firewall,
        clock,
        self_id,
        evaluation_interval,
    })
    .await?;

    let shutdown = ShutdownToken::new();
    listen_for_signals(shutdown.clone());

    let server = ControlServer::bind(&socket_path)?;
    let (handle, engine_task) = engine.spawn(shutdown.clone());
    let server_task = tokio::spawn(server.serve(handle, shutdown.clone()));

    info!("AppFence daemon started (pid {})", std::process::id());
    shutdown.cancelled().await;

    if let Err(e) = engine_task.await {
        warn!("Policy engine task ended abnormally: {}", e);
    }
    if let Err(e) = server_task.await {
        warn!("Control server task ended abnormally: {}", e);
    }
    info!("AppFence daemon stopped");
    Ok(())
}
