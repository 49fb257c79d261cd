//! Enforcement surfaces: the mechanisms that actually cut network access.

mod log;
mod nftables;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

pub use self::log::LogSurface;
pub use self::nftables::NftablesSurface;

use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::Backend;
use crate::error::AppFenceError;
use crate::sources::PackageCatalog;

/// How the listed packages are treated while the surface is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Every application except the agent itself loses network access.
    Blocking,
    /// Only the listed applications lose network access.
    SelectiveAllow,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementMode::Blocking => "blocking",
            EnforcementMode::SelectiveAllow => "selective-allow",
        }
    }
}

/// OS-level mechanism restricting per-application network I/O.
#[async_trait]
pub trait EnforcementSurface: Send + Sync {
    /// Establish (or replace) the restriction for `packages`.
    async fn start(&self, mode: EnforcementMode, packages: &BTreeSet<String>) -> Result<()>;

    /// Remove every restriction. Passthrough afterwards.
    async fn stop(&self) -> Result<()>;

    /// Whether a restriction is currently established.
    async fn is_active(&self) -> Result<bool>;

    /// Short backend name for status output.
    fn name(&self) -> &'static str;
}

/// Create the enforcement surface selected in the configuration.
pub fn create_surface(
    backend: Backend,
    catalog: Arc<dyn PackageCatalog>,
    self_id: &str,
) -> Arc<dyn EnforcementSurface> {
    match backend {
        Backend::Nftables => Arc::new(NftablesSurface::new(catalog, self_id, RealCommandExecutor)),
        Backend::Log => Arc::new(LogSurface::new()),
    }
}

/// Check if running as root (effective UID == 0).
///
/// Loading nftables rules needs CAP_NET_ADMIN; checking the effective uid
/// covers the usual sudo/systemd setups.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        return Err(AppFenceError::Permission(
            "the nftables backend requires root privileges. Run with sudo, \
             or select the `log` backend in the configuration."
                .to_string(),
        )
        .into());
    }
    Ok(())
}
