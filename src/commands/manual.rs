//! Manual unblock mode toggle.

use anyhow::Result;
use std::path::Path;

use crate::cli::Toggle;
use crate::control::Method;

pub async fn run(state: Toggle, config_path: &Path) -> Result<()> {
    let report = super::request(config_path, Method::SetManual { enabled: state.is_on() }).await?;

    if report.manual_mode {
        println!("[OK] Manual unblock mode on");
        println!("     Use 'appfence unblock <package>' to release an app.");
    } else {
        println!("[OK] Manual unblock mode off");
    }
    Ok(())
}
