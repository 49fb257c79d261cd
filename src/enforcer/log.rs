//! Log-only enforcement backend for dry runs and hosts without nftables.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use super::{EnforcementMode, EnforcementSurface};

#[derive(Debug, Default)]
pub struct LogSurface {
    active: AtomicBool,
}

impl LogSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnforcementSurface for LogSurface {
    async fn start(&self, mode: EnforcementMode, packages: &BTreeSet<String>) -> Result<()> {
        let listed: Vec<&str> = packages.iter().map(String::as_str).collect();
        info!(
            "[dry-run] enforcement {} for {} packages: {}",
            mode.as_str(),
            packages.len(),
            listed.join(", ")
        );
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("[dry-run] enforcement stopped, traffic passes through");
        }
        Ok(())
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(self.active.load(Ordering::SeqCst))
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracks_active_flag() {
        let surface = LogSurface::new();
        assert!(!surface.is_active().await.unwrap());

        let packages: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        surface.start(EnforcementMode::SelectiveAllow, &packages).await.unwrap();
        assert!(surface.is_active().await.unwrap());

        surface.stop().await.unwrap();
        assert!(!surface.is_active().await.unwrap());
    }
}
