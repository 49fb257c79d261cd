//! Error types for AppFence.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppFenceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Usage access not granted: {0}")]
    UsageAccessDenied(String),

    #[error("Enforcement error: {0}")]
    Enforcement(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Control protocol error: {0}")]
    Control(String),

    #[error("Manual firewall mode is active; use 'appfence unblock <package>' instead")]
    ManualModeActive,

    #[error("Daemon is not running (no socket at {0})")]
    DaemonNotRunning(String),
}
