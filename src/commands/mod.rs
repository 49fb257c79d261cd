//! CLI command implementations.
//!
//! Everything except `init`, `run` and `version` talks to the running
//! daemon over the control socket.

pub mod allowlist;
pub mod allow;
pub mod block;
pub mod disable;
pub mod duration;
pub mod enable;
pub mod init;
pub mod manual;
pub mod metrics;
pub mod refresh;
pub mod run;
pub mod status;
pub mod unblock;

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::control::{self, Method};
use crate::engine::StatusReport;

/// Send `method` to the daemon configured in `config_path`.
pub(crate) async fn request(config_path: &Path, method: Method) -> Result<StatusReport> {
    let config = Config::load_or_default(config_path)?;
    control::call(&config.paths.socket, method).await
}

/// One-line summary of the firewall phase, shared by several commands.
pub(crate) fn phase_line(report: &StatusReport) -> String {
    let mut line = format!("Firewall: {}", report.phase.to_uppercase());
    if let Some(at) = report.firewall.reactivate_at {
        line.push_str(&format!(" (blocking resumes {})", crate::utils::format_timestamp(at)));
    }
    line
}
