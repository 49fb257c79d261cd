//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM cancel a shared [`ShutdownToken`]. Long-running
//! tasks (engine loop, control server) await `cancelled()` in their
//! `select!` loops.

use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

/// Cloneable, awaitable cancellation flag.
#[derive(Clone)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Request cancellation of every clone of this token.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // the sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM.
///
/// If a handler cannot be registered (restricted environments) the other
/// one still works; with neither, only explicit cancellation stops the
/// daemon.
pub fn listen_for_signals(token: ShutdownToken) {
    tokio::spawn(async move {
        let sigint = signal(SignalKind::interrupt())
            .map_err(|e| warn!("Failed to register SIGINT handler: {}", e))
            .ok();
        let sigterm = signal(SignalKind::terminate())
            .map_err(|e| warn!("Failed to register SIGTERM handler: {}", e))
            .ok();

        match (sigint, sigterm) {
            (Some(mut int), Some(mut term)) => {
                tokio::select! {
                    _ = int.recv() => info!("Received SIGINT, shutting down..."),
                    _ = term.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            (Some(mut int), None) => {
                int.recv().await;
                info!("Received SIGINT, shutting down...");
            }
            (None, Some(mut term)) => {
                term.recv().await;
                info!("Received SIGTERM, shutting down...");
            }
            (None, None) => {
                warn!("No signal handlers registered - graceful shutdown disabled");
                return;
            }
        }
        token.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_clones_share_state() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = ShutdownToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }
}
