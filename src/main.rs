//! AppFence - usage-driven per-application network firewall.
//!
//! Applications that stay unused lose network access until they are used
//! again.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use appfence::cli::{Cli, Commands};
use appfence::commands;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => commands::init::run(force, &cli.config).await,
        Commands::Run => commands::run::run(&cli.config).await,
        Commands::Status { json } => commands::status::run(json, &cli.config).await,
        Commands::Enable => commands::enable::run(&cli.config).await,
        Commands::Disable => commands::disable::run(&cli.config).await,
        Commands::Block => commands::block::run(&cli.config).await,
        Commands::Allow => commands::allow::run(&cli.config).await,
        Commands::Unblock { package } => commands::unblock::run(&package, &cli.config).await,
        Commands::Manual { state } => commands::manual::run(state, &cli.config).await,
        Commands::Duration { value } => commands::duration::run(&value, &cli.config).await,
        Commands::Metrics { state } => commands::metrics::run(state, &cli.config).await,
        Commands::Allowlist { action } => commands::allowlist::run(action, &cli.config).await,
        Commands::Refresh => commands::refresh::run(&cli.config).await,
        Commands::Version => {
            println!("appfence {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
